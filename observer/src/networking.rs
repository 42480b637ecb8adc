//! Stream protocols spoken between validators.
//!
//! Every protocol exchanges length-prefixed frames: a big-endian `u32` length followed by that many bytes. After
//! writing a request frame the sender reads a single ack frame, whose payload is one of the [Ack] symbols.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use tokio::{sync::watch, task::JoinSet, time::timeout};
use tracing::*;

use crate::{
    bridge::{PeerHost, PeerStream, StreamError},
    engine::AttestationGatherer,
    error::AttestationError,
    message::{self, AttestErrataTx, AttestNetworkFee, AttestSolvency, AttestTx, AttestationBatch},
    metrics::Metrics,
};

pub const BATCHED_ATTESTATION: StreamProtocol = StreamProtocol::new("/p2p/batched-attestation");
pub const OBSERVED_TX: StreamProtocol = StreamProtocol::new("/p2p/observed-tx");
pub const NETWORK_FEE: StreamProtocol = StreamProtocol::new("/p2p/network-fee");
pub const SOLVENCY: StreamProtocol = StreamProtocol::new("/p2p/solvency");
pub const ERRATA_TX: StreamProtocol = StreamProtocol::new("/p2p/errata-tx");
pub const ATTESTATION_STATE: StreamProtocol = StreamProtocol::new("/p2p/attestation-state");

/// Protocols carrying attestations, in the order legacy fallback sends them.
pub const LEGACY_PROTOCOLS: [StreamProtocol; 4] = [OBSERVED_TX, NETWORK_FEE, SOLVENCY, ERRATA_TX];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Done,
    Begin,
    Header,
    Data,
    Error,
}

impl Ack {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Ack::Done => b"done",
            Ack::Begin => b"ack_begin",
            Ack::Header => b"ack_header",
            Ack::Data => b"ack_data",
            Ack::Error => b"error",
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(io: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(payload).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(io: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    io.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > message::MAX_DECODE_BYTES {
        return Err(AttestationError::InvalidEncoding(format!("frame of {len} bytes is too large")).into());
    }
    let mut payload = vec![0; len];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_ack<W: AsyncWrite + Unpin + ?Sized>(io: &mut W, ack: Ack) -> Result<()> {
    write_frame(io, ack.as_bytes()).await
}

pub async fn expect_ack<R: AsyncRead + Unpin + ?Sized>(io: &mut R, ack: Ack) -> Result<()> {
    let frame = read_frame(io).await?;
    if frame != ack.as_bytes() {
        return Err(AttestationError::PeerUnavailable(format!(
            "expected {:?} ack, got {:?}",
            ack,
            String::from_utf8_lossy(&frame)
        ))
        .into());
    }
    Ok(())
}

pub async fn open_stream(
    host: &dyn PeerHost,
    peer: PeerId,
    protocol: StreamProtocol,
) -> Result<PeerStream> {
    host.new_stream(peer, protocol)
        .await
        .map_err(|e| match e {
            StreamError::ProtocolNotSupported => AttestationError::ProtocolNotSupported.into(),
            StreamError::Unavailable(reason) => AttestationError::PeerUnavailable(reason).into(),
        })
}

/// Send a single frame on a fresh stream and wait for the `done` ack.
pub async fn send_request(
    host: &dyn PeerHost,
    peer: PeerId,
    protocol: StreamProtocol,
    payload: &[u8],
) -> Result<()> {
    let mut stream = open_stream(host, peer, protocol).await?;
    write_frame(&mut stream, payload).await?;
    expect_ack(&mut stream, Ack::Done).await?;
    let _ = stream.close().await;
    Ok(())
}

/// Inbound side of the attestation protocols.
pub struct AttestationServer {
    engine: Arc<AttestationGatherer>,
    max_batch_size: usize,
    peer_timeout: Duration,
    metrics: Metrics,
}

impl AttestationServer {
    pub fn new(
        engine: Arc<AttestationGatherer>,
        max_batch_size: usize,
        peer_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        AttestationServer {
            engine,
            max_batch_size,
            peer_timeout,
            metrics,
        }
    }

    /// Register a handler for the batched and legacy protocols. Each accepted stream is handled in its own task.
    pub fn listen(
        self: &Arc<Self>,
        host: &dyn PeerHost,
        tasks: &mut JoinSet<()>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        for protocol in std::iter::once(BATCHED_ATTESTATION).chain(LEGACY_PROTOCOLS) {
            let mut incoming = host.accept(protocol.clone())?;
            let server = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        next = incoming.next() => {
                            let Some((peer, stream)) = next else {
                                break;
                            };
                            tokio::spawn(server.clone().handle_stream(protocol.clone(), peer, stream));
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!(%protocol, "stopped accepting streams");
            });
        }
        Ok(())
    }

    pub async fn handle_stream(
        self: Arc<Self>,
        protocol: StreamProtocol,
        peer: PeerId,
        mut stream: PeerStream,
    ) {
        let frame = match timeout(self.peer_timeout, read_frame(&mut stream)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!(%peer, %protocol, "failed to read frame: {e}");
                return;
            }
            Err(_) => {
                debug!(%peer, %protocol, "timed out reading frame");
                return;
            }
        };

        // Inactive peers get the same ack as everyone else.
        if let Err(e) = write_ack(&mut stream, Ack::Done).await {
            debug!(%peer, %protocol, "failed to ack: {e}");
        }
        let _ = stream.close().await;

        if !self.engine.validators().contains_peer(&peer) {
            debug!(%peer, %protocol, "discarding attestations from inactive peer");
            return;
        }

        if let Err(e) = self.dispatch(&protocol, &frame).await {
            self.metrics.rejected(&e);
            debug!(%peer, %protocol, "rejected attestation: {e}");
        }
    }

    async fn dispatch(&self, protocol: &StreamProtocol, frame: &[u8]) -> Result<()> {
        if *protocol == BATCHED_ATTESTATION {
            let batch: AttestationBatch = message::decode(frame)?;
            batch.check_limits(self.max_batch_size)?;
            self.engine.handle_batch(batch).await;
        } else if *protocol == OBSERVED_TX {
            self.engine
                .handle_attest_tx(message::decode::<AttestTx>(frame)?)
                .await?;
        } else if *protocol == NETWORK_FEE {
            self.engine
                .handle_attest_network_fee(message::decode::<AttestNetworkFee>(frame)?)
                .await?;
        } else if *protocol == SOLVENCY {
            self.engine
                .handle_attest_solvency(message::decode::<AttestSolvency>(frame)?)
                .await?;
        } else if *protocol == ERRATA_TX {
            self.engine
                .handle_attest_errata_tx(message::decode::<AttestErrataTx>(frame)?)
                .await?;
        } else {
            return Err(anyhow!("no handler for {protocol}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::io::Cursor;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        broadcast::BatchBroadcaster,
        cfg::AttestationConfig,
        crypto::SecretKey,
        item::{Attestation, Coin, ErrataTx, NetworkFee, Solvency, TxId, VaultPubKey, tests::observed_tx},
        test_util::{MemoryNetwork, wait_until},
        validators::{ActiveValidators, ValidatorSet},
    };

    fn keys(n: u8) -> Vec<SecretKey> {
        (1..=n)
            .map(|i| SecretKey::from_bytes(&[i; 32]).unwrap())
            .collect()
    }

    fn active(keys: &[SecretKey]) -> ActiveValidators {
        ActiveValidators::new(ValidatorSet::new(keys.iter().map(SecretKey::node_public_key)))
    }

    /// An engine for `key` whose validator set is `validators`, with nothing to submit to.
    fn engine(network: &MemoryNetwork, key: SecretKey, validators: &[SecretKey]) -> Arc<AttestationGatherer> {
        let config = AttestationConfig::default();
        let validators = active(validators);
        let broadcaster = Arc::new(BatchBroadcaster::new(
            &config,
            network.host(key.peer_id()),
            validators.clone(),
            Metrics::default(),
        ));
        let bridge = Arc::new(crate::test_util::MockBridge::new(vec![]));
        let (commands, _) = mpsc::unbounded_channel();
        Arc::new(AttestationGatherer::new(
            key,
            config,
            bridge,
            validators,
            broadcaster,
            commands,
            Metrics::default(),
        ))
    }

    fn server(engine: Arc<AttestationGatherer>, max_batch_size: usize) -> Arc<AttestationServer> {
        Arc::new(AttestationServer::new(
            engine,
            max_batch_size,
            Duration::from_secs(2),
            Metrics::default(),
        ))
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

    fn batch_of(txs: Vec<AttestTx>) -> Vec<u8> {
        message::encode(&AttestationBatch {
            attest_txs: txs,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn inactive_peers_are_acked_but_ignored() {
        let network = MemoryNetwork::default();
        let keys = keys(4);
        let validators = &keys[..3];
        let receiver = engine(&network, keys[1], validators);
        let (_stop, shutdown) = watch::channel(false);
        let mut tasks = JoinSet::new();
        server(receiver.clone(), 10)
            .listen(&*network.host(keys[1].peer_id()), &mut tasks, shutdown)
            .unwrap();

        // The attestation itself is valid, only the relaying peer is not a validator.
        let outsider = network.host(keys[3].peer_id());
        send_request(
            &*outsider,
            keys[1].peer_id(),
            BATCHED_ATTESTATION,
            &batch_of(vec![attest_tx(&keys[2], "relayed")]),
        )
        .await
        .unwrap();

        let validator = network.host(keys[2].peer_id());
        send_request(
            &*validator,
            keys[1].peer_id(),
            BATCHED_ATTESTATION,
            &batch_of(vec![attest_tx(&keys[2], "direct")]),
        )
        .await
        .unwrap();

        wait_until(Duration::from_secs(5), || receiver.state_counts()[0] == 1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let states = receiver.attestation_states().await;
        assert_eq!(states.observed_txs.len(), 1);
        assert_eq!(states.observed_txs[0].item["tx"]["id"], "direct");
    }

    #[tokio::test]
    async fn batches_over_the_kind_limit_are_rejected() {
        let network = MemoryNetwork::default();
        let keys = keys(3);
        let receiver = engine(&network, keys[1], &keys);
        let (_stop, shutdown) = watch::channel(false);
        let mut tasks = JoinSet::new();
        server(receiver.clone(), 2)
            .listen(&*network.host(keys[1].peer_id()), &mut tasks, shutdown)
            .unwrap();
        let sender = network.host(keys[0].peer_id());

        let oversized = batch_of(vec![
            attest_tx(&keys[0], "a"),
            attest_tx(&keys[0], "b"),
            attest_tx(&keys[0], "c"),
        ]);
        send_request(&*sender, keys[1].peer_id(), BATCHED_ATTESTATION, &oversized)
            .await
            .unwrap();

        let within = batch_of(vec![attest_tx(&keys[0], "d"), attest_tx(&keys[0], "e")]);
        send_request(&*sender, keys[1].peer_id(), BATCHED_ATTESTATION, &within)
            .await
            .unwrap();

        wait_until(Duration::from_secs(5), || receiver.state_counts()[0] == 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(receiver.state_counts()[0], 2);
    }

    #[tokio::test]
    async fn legacy_peers_receive_every_kind() {
        let network = MemoryNetwork::default();
        let keys = keys(2);
        let receiver = engine(&network, keys[1], &keys);
        let server = server(receiver.clone(), 10);
        // A peer that only speaks the per-kind protocols.
        let host = network.host(keys[1].peer_id());
        for protocol in LEGACY_PROTOCOLS {
            let mut incoming = host.accept(protocol.clone()).unwrap();
            let server = server.clone();
            tokio::spawn(async move {
                while let Some((peer, stream)) = incoming.next().await {
                    tokio::spawn(server.clone().handle_stream(protocol.clone(), peer, stream));
                }
            });
        }

        let broadcaster = BatchBroadcaster::new(
            &AttestationConfig::default(),
            network.host(keys[0].peer_id()),
            active(&keys),
            Metrics::default(),
        );
        let fee = NetworkFee {
            chain: "BTC".parse().unwrap(),
            height: 1,
            transaction_size: 250,
            transaction_rate: 20,
        };
        let solvency = Solvency {
            chain: "BTC".parse().unwrap(),
            height: 1,
            pub_key: VaultPubKey::new("vaultpub1"),
            coins: vec![Coin::new("BTC.BTC", 1_000)],
        };
        let errata = ErrataTx {
            chain: "BTC".parse().unwrap(),
            id: TxId::new("revoked"),
        };
        broadcaster.add_attest_tx(attest_tx(&keys[0], "a"));
        broadcaster.add_attest_network_fee(AttestNetworkFee {
            attestation: Attestation::sign(&fee, &keys[0]).unwrap(),
            network_fee: fee,
        });
        broadcaster.add_attest_solvency(AttestSolvency {
            attestation: Attestation::sign(&solvency, &keys[0]).unwrap(),
            solvency,
        });
        broadcaster.add_attest_errata_tx(AttestErrataTx {
            attestation: Attestation::sign(&errata, &keys[0]).unwrap(),
            errata_tx: errata,
        });
        broadcaster.flush().join_all().await;

        wait_until(Duration::from_secs(5), || receiver.state_counts() == [1, 1, 1, 1])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn frames_are_length_prefixed() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"hello").await.unwrap();
        assert_eq!(buf.get_ref().as_slice(), b"\0\0\0\x05hello");

        buf.set_position(0);
        assert_eq!(read_frame(&mut buf).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        let err = read_frame(&mut buf).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AttestationError>(),
            Some(AttestationError::InvalidEncoding(_))
        ));
    }

    #[tokio::test]
    async fn unexpected_ack_is_a_peer_failure() {
        let mut buf = Cursor::new(Vec::new());
        write_ack(&mut buf, Ack::Begin).await.unwrap();
        buf.set_position(0);
        let err = expect_ack(&mut buf, Ack::Done).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AttestationError>(),
            Some(AttestationError::PeerUnavailable(_))
        ));

        buf.set_position(0);
        expect_ack(&mut buf, Ack::Begin).await.unwrap();
    }

    #[test]
    fn protocol_ids() {
        assert_eq!(BATCHED_ATTESTATION.as_ref(), "/p2p/batched-attestation");
        assert_eq!(ATTESTATION_STATE.as_ref(), "/p2p/attestation-state");
        assert_eq!(LEGACY_PROTOCOLS[0], OBSERVED_TX);
    }
}
