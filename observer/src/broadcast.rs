//! Batches our own attestations and fans them out to every active validator we are connected to.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Result;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch},
    task::JoinSet,
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::*;

use crate::{
    bridge::PeerHost,
    cfg::AttestationConfig,
    error::AttestationError,
    message::{
        self, AttestErrataTx, AttestNetworkFee, AttestSolvency, AttestTx, AttestationBatch,
    },
    metrics::Metrics,
    networking::{BATCHED_ATTESTATION, ERRATA_TX, NETWORK_FEE, OBSERVED_TX, SOLVENCY, send_request},
    validators::ActiveValidators,
};

type PeerSlots = Arc<Mutex<HashMap<PeerId, Arc<Semaphore>>>>;

/// A claimed send slot for one peer. Dropping it frees the slot, and forgets the peer entirely once it has no sends in
/// flight.
struct PeerSlot {
    peer: PeerId,
    permit: Option<OwnedSemaphorePermit>,
    slots: PeerSlots,
    capacity: usize,
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut slots = self.slots.lock();
        if let Some(semaphore) = slots.get(&self.peer) {
            if Arc::strong_count(semaphore) == 1 && semaphore.available_permits() == self.capacity {
                slots.remove(&self.peer);
            }
        }
    }
}

/// One flush worth of attestations, shared by every per-peer send. The flush duration is recorded when the last send
/// releases it.
struct Outbound {
    batch: AttestationBatch,
    payload: Vec<u8>,
    legacy: OnceLock<Vec<(StreamProtocol, Vec<u8>)>>,
    started: Instant,
    metrics: Metrics,
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.metrics.flush_took(self.started.elapsed().as_secs_f64());
    }
}

impl Outbound {
    /// The batch split into single-item frames for peers that do not speak the batched protocol. Computed at most once.
    fn legacy(&self) -> &[(StreamProtocol, Vec<u8>)] {
        self.legacy.get_or_init(|| legacy_frames(&self.batch))
    }
}

fn legacy_frames(batch: &AttestationBatch) -> Vec<(StreamProtocol, Vec<u8>)> {
    let mut frames = Vec::with_capacity(batch.len());
    let encoded = batch
        .attest_txs
        .iter()
        .map(|m| (OBSERVED_TX, message::encode(m)))
        .chain(
            batch
                .attest_network_fees
                .iter()
                .map(|m| (NETWORK_FEE, message::encode(m))),
        )
        .chain(
            batch
                .attest_solvencies
                .iter()
                .map(|m| (SOLVENCY, message::encode(m))),
        )
        .chain(
            batch
                .attest_errata_txs
                .iter()
                .map(|m| (ERRATA_TX, message::encode(m))),
        );
    for (protocol, payload) in encoded {
        match payload {
            Ok(payload) => frames.push((protocol, payload)),
            Err(e) => error!(%protocol, "failed to encode attestation: {e}"),
        }
    }
    frames
}

pub struct BatchBroadcaster {
    host: Arc<dyn PeerHost>,
    validators: ActiveValidators,
    batch_interval: Duration,
    max_batch_size: usize,
    peer_timeout: Duration,
    peer_concurrent_sends: usize,
    pending: Mutex<AttestationBatch>,
    force_send: mpsc::Sender<()>,
    force_send_receiver: Mutex<Option<mpsc::Receiver<()>>>,
    peer_slots: PeerSlots,
    metrics: Metrics,
}

impl BatchBroadcaster {
    pub fn new(
        config: &AttestationConfig,
        host: Arc<dyn PeerHost>,
        validators: ActiveValidators,
        metrics: Metrics,
    ) -> Self {
        let (force_send, force_send_receiver) = mpsc::channel(1);
        BatchBroadcaster {
            host,
            validators,
            batch_interval: config.batch_interval,
            max_batch_size: config.max_batch_size,
            peer_timeout: config.peer_timeout,
            peer_concurrent_sends: config.peer_concurrent_sends,
            pending: Mutex::new(AttestationBatch::default()),
            force_send,
            force_send_receiver: Mutex::new(Some(force_send_receiver)),
            peer_slots: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    pub fn add_attest_tx(&self, message: AttestTx) {
        let len = {
            let mut pending = self.pending.lock();
            pending.attest_txs.push(message);
            pending.attest_txs.len()
        };
        self.maybe_force_send(len);
    }

    pub fn add_attest_network_fee(&self, message: AttestNetworkFee) {
        let len = {
            let mut pending = self.pending.lock();
            pending.attest_network_fees.push(message);
            pending.attest_network_fees.len()
        };
        self.maybe_force_send(len);
    }

    pub fn add_attest_solvency(&self, message: AttestSolvency) {
        let len = {
            let mut pending = self.pending.lock();
            pending.attest_solvencies.push(message);
            pending.attest_solvencies.len()
        };
        self.maybe_force_send(len);
    }

    pub fn add_attest_errata_tx(&self, message: AttestErrataTx) {
        let len = {
            let mut pending = self.pending.lock();
            pending.attest_errata_txs.push(message);
            pending.attest_errata_txs.len()
        };
        self.maybe_force_send(len);
    }

    fn maybe_force_send(&self, len: usize) {
        if len >= self.max_batch_size {
            // A full channel means a flush is already pending.
            let _ = self.force_send.try_send(());
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn acquire_slot(&self, peer: PeerId) -> Option<PeerSlot> {
        let semaphore = self
            .peer_slots
            .lock()
            .entry(peer)
            .or_insert_with(|| Arc::new(Semaphore::new(self.peer_concurrent_sends)))
            .clone();
        let permit = semaphore.try_acquire_owned().ok()?;
        Some(PeerSlot {
            peer,
            permit: Some(permit),
            slots: self.peer_slots.clone(),
            capacity: self.peer_concurrent_sends,
        })
    }

    /// Take everything pending and start sending it to each active validator peer. Returns the per-peer send tasks.
    pub fn flush(&self) -> JoinSet<()> {
        let mut sends = JoinSet::new();
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return sends;
        }
        let start = Instant::now();

        let local = self.host.local_peer_id();
        let validators = self.validators.load();
        let peers: Vec<_> = self
            .host
            .peers()
            .into_iter()
            .filter(|p| *p != local && validators.contains_peer(p))
            .collect();
        if peers.is_empty() {
            debug!(attestations = batch.len(), "no validator peers to send to");
            return sends;
        }

        let payload = match message::encode(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode attestation batch: {e}");
                return sends;
            }
        };
        trace!(attestations = batch.len(), peers = peers.len(), "flushing attestations");
        let outbound = Arc::new(Outbound {
            batch,
            payload,
            legacy: OnceLock::new(),
            started: start,
            metrics: self.metrics.clone(),
        });

        for peer in peers {
            let Some(slot) = self.acquire_slot(peer) else {
                debug!(%peer, "all send slots busy, skipping peer for this flush");
                continue;
            };
            let host = self.host.clone();
            let outbound = outbound.clone();
            let peer_timeout = self.peer_timeout;
            let metrics = self.metrics.clone();
            sends.spawn(async move {
                let result = send_to_peer(host.as_ref(), peer, &outbound, peer_timeout).await;
                drop(slot);
                if let Err(e) = result {
                    metrics.peer_send_failed(&e);
                    debug!(%peer, "failed to send attestations: {e}");
                }
            });
        }
        sends
    }

    /// Flush on every batch interval tick and whenever a kind fills up, until shutdown. Pending attestations are
    /// flushed once more before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut force_send) = self.force_send_receiver.lock().take() else {
            error!("broadcaster is already running");
            return;
        };
        let mut ticker = interval(self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush().detach_all(),
                Some(()) = force_send.recv() => self.flush().detach_all(),
                _ = shutdown.changed() => break,
            }
        }
        self.flush().join_all().await;
        debug!("broadcaster stopped");
    }
}

async fn send_with_timeout(
    host: &dyn PeerHost,
    peer: PeerId,
    protocol: StreamProtocol,
    payload: &[u8],
    peer_timeout: Duration,
) -> Result<()> {
    match timeout(peer_timeout, send_request(host, peer, protocol, payload)).await {
        Ok(result) => result,
        Err(_) => Err(AttestationError::PeerUnavailable(format!("timed out after {peer_timeout:?}")).into()),
    }
}

async fn send_to_peer(
    host: &dyn PeerHost,
    peer: PeerId,
    outbound: &Outbound,
    peer_timeout: Duration,
) -> Result<()> {
    let result = send_with_timeout(
        host,
        peer,
        BATCHED_ATTESTATION,
        &outbound.payload,
        peer_timeout,
    )
    .await;
    match result {
        Err(e)
            if matches!(
                e.downcast_ref::<AttestationError>(),
                Some(AttestationError::ProtocolNotSupported)
            ) =>
        {
            debug!(%peer, "peer does not support batches, falling back to single attestations");
            for (protocol, payload) in outbound.legacy() {
                send_with_timeout(host, peer, protocol.clone(), payload, peer_timeout).await?;
            }
            Ok(())
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{
        crypto::SecretKey,
        item::{Attestation, ErrataTx, NetworkFee, TxId, tests::observed_tx},
        networking::{Ack, read_frame, write_ack},
        test_util::MemoryNetwork,
        validators::ValidatorSet,
    };

    fn keys(n: u8) -> Vec<SecretKey> {
        (1..=n)
            .map(|i| SecretKey::from_bytes(&[i; 32]).unwrap())
            .collect()
    }

    fn attest_tx(key: &SecretKey, id: &str) -> AttestTx {
        let obs_tx = observed_tx(id, 1);
        AttestTx {
            attestation: Attestation::sign(&obs_tx, key).unwrap(),
            obs_tx,
            inbound: true,
            allow_future_observation: false,
        }
    }

    fn broadcaster(
        network: &MemoryNetwork,
        keys: &[SecretKey],
        validators: usize,
        config: AttestationConfig,
    ) -> BatchBroadcaster {
        let active = ActiveValidators::new(ValidatorSet::new(
            keys[..validators].iter().map(SecretKey::node_public_key),
        ));
        BatchBroadcaster::new(&config, network.host(keys[0].peer_id()), active, Metrics::default())
    }

    /// Accept streams on `protocol` and forward each received frame before acking it.
    fn receive_into(
        network: &MemoryNetwork,
        peer: PeerId,
        protocol: StreamProtocol,
        sender: mpsc::UnboundedSender<(StreamProtocol, Vec<u8>)>,
    ) {
        let mut incoming = network.host(peer).accept(protocol.clone()).unwrap();
        tokio::spawn(async move {
            while let Some((_, mut stream)) = incoming.next().await {
                let frame = read_frame(&mut stream).await.unwrap();
                let _ = sender.send((protocol.clone(), frame));
                write_ack(&mut stream, Ack::Done).await.unwrap();
            }
        });
    }

    fn receive(
        network: &MemoryNetwork,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> mpsc::UnboundedReceiver<(StreamProtocol, Vec<u8>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        receive_into(network, peer, protocol, sender);
        receiver
    }

    #[tokio::test]
    async fn full_kind_signals_a_flush_once() {
        let network = MemoryNetwork::default();
        let keys = keys(1);
        let config = AttestationConfig {
            max_batch_size: 2,
            ..Default::default()
        };
        let broadcaster = broadcaster(&network, &keys, 1, config);
        let mut force_send = broadcaster.force_send_receiver.lock().take().unwrap();

        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        assert!(force_send.try_recv().is_err());
        broadcaster.add_attest_tx(attest_tx(&keys[0], "b"));
        broadcaster.add_attest_tx(attest_tx(&keys[0], "c"));
        assert!(force_send.try_recv().is_ok());
        assert!(force_send.try_recv().is_err());
        assert_eq!(broadcaster.pending_len(), 3);
    }

    #[tokio::test]
    async fn flush_reaches_validator_peers_only() {
        let network = MemoryNetwork::default();
        let keys = keys(4);
        let broadcaster = broadcaster(&network, &keys, 3, AttestationConfig::default());
        let mut validator = receive(&network, keys[1].peer_id(), BATCHED_ATTESTATION);
        let mut outsider = receive(&network, keys[3].peer_id(), BATCHED_ATTESTATION);

        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        broadcaster.flush().join_all().await;
        assert_eq!(broadcaster.pending_len(), 0);

        let (_, frame) = validator.try_recv().unwrap();
        let batch: AttestationBatch = message::decode(&frame).unwrap();
        assert_eq!(batch.attest_txs.len(), 1);
        assert!(outsider.try_recv().is_err());
    }

    #[tokio::test]
    async fn legacy_fallback_sends_kinds_in_order() {
        let network = MemoryNetwork::default();
        let keys = keys(2);
        let broadcaster = broadcaster(&network, &keys, 2, AttestationConfig::default());
        let peer = keys[1].peer_id();
        let (sender, mut received) = mpsc::unbounded_channel();
        for protocol in [ERRATA_TX, NETWORK_FEE, OBSERVED_TX, SOLVENCY] {
            receive_into(&network, peer, protocol, sender.clone());
        }

        let fee = NetworkFee {
            chain: "BTC".parse().unwrap(),
            height: 1,
            transaction_size: 250,
            transaction_rate: 20,
        };
        let errata = ErrataTx {
            chain: "BTC".parse().unwrap(),
            id: TxId::new("revoked"),
        };
        broadcaster.add_attest_errata_tx(AttestErrataTx {
            attestation: Attestation::sign(&errata, &keys[0]).unwrap(),
            errata_tx: errata,
        });
        broadcaster.add_attest_network_fee(AttestNetworkFee {
            attestation: Attestation::sign(&fee, &keys[0]).unwrap(),
            network_fee: fee,
        });
        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        broadcaster.add_attest_tx(attest_tx(&keys[0], "b"));
        broadcaster.flush().join_all().await;

        let mut order = Vec::new();
        for _ in 0..4 {
            let (protocol, _) = tokio::time::timeout(Duration::from_secs(5), received.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(protocol);
        }
        assert_eq!(order, [OBSERVED_TX, OBSERVED_TX, NETWORK_FEE, ERRATA_TX]);
    }

    #[tokio::test]
    async fn busy_peers_are_skipped_and_slots_are_forgotten() {
        let network = MemoryNetwork::default();
        let keys = keys(2);
        let config = AttestationConfig {
            peer_concurrent_sends: 1,
            ..Default::default()
        };
        let broadcaster = broadcaster(&network, &keys, 2, config);
        let mut peer = receive(&network, keys[1].peer_id(), BATCHED_ATTESTATION);

        let held = broadcaster.acquire_slot(keys[1].peer_id()).unwrap();
        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        broadcaster.flush().join_all().await;
        assert!(peer.try_recv().is_err());
        // The skipped attestation is not re-queued.
        assert_eq!(broadcaster.pending_len(), 0);

        drop(held);
        assert!(broadcaster.peer_slots.lock().is_empty());

        broadcaster.add_attest_tx(attest_tx(&keys[0], "b"));
        broadcaster.flush().join_all().await;
        assert!(peer.try_recv().is_ok());
        assert!(broadcaster.peer_slots.lock().is_empty());
    }

    #[tokio::test]
    async fn flush_duration_covers_the_peer_sends() {
        use opentelemetry::metrics::MeterProvider;
        use opentelemetry_sdk::metrics::{
            InMemoryMetricExporter, PeriodicReader, SdkMeterProvider, data,
        };

        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone()).build())
            .build();
        let network = MemoryNetwork::default();
        let keys = keys(2);
        let config = AttestationConfig {
            peer_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let active = ActiveValidators::new(ValidatorSet::new(keys.iter().map(SecretKey::node_public_key)));
        let broadcaster = BatchBroadcaster::new(
            &config,
            network.host(keys[0].peer_id()),
            active,
            Metrics::with_meter(&provider.meter("observer")),
        );
        // The only peer never answers, so the flush lasts until the send times out.
        let _silent = network.host(keys[1].peer_id()).accept(BATCHED_ATTESTATION).unwrap();

        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        broadcaster.flush().join_all().await;
        provider.force_flush().unwrap();

        let exported = exporter.get_finished_metrics().unwrap();
        let metric = exported
            .iter()
            .flat_map(|r| &r.scope_metrics)
            .flat_map(|s| &s.metrics)
            .find(|m| m.name == "observer.broadcast.flush.duration")
            .unwrap();
        let histogram = metric
            .data
            .as_any()
            .downcast_ref::<data::Histogram<f64>>()
            .unwrap();
        assert_eq!(histogram.data_points[0].count, 1);
        assert!(histogram.data_points[0].sum >= 0.2);
    }

    #[tokio::test]
    async fn unreachable_peers_do_not_block_others() {
        let network = MemoryNetwork::default();
        let keys = keys(3);
        let config = AttestationConfig {
            peer_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let broadcaster = broadcaster(&network, &keys, 3, config);
        // Peer 2 is connected but never reads from its streams.
        let _silent = network.host(keys[2].peer_id()).accept(BATCHED_ATTESTATION).unwrap();
        let mut peer = receive(&network, keys[1].peer_id(), BATCHED_ATTESTATION);

        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        broadcaster.flush().join_all().await;
        assert!(peer.try_recv().is_ok());
    }
}
