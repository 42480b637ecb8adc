//! Recovery of post-quorum attestation state from peers after a restart.
//!
//! A transfer on [ATTESTATION_STATE] looks like this, where every frame carries a one-byte type prefix and each line
//! is acked by the other side:
//!
//! ```text
//! client: 0x01                              server: error (if the request is malformed)
//! server: 0x02 StateSyncBegin { batches }   client: ack_begin
//! server: 0x03 StateSyncHeader { index, items }   client: ack_header   } once per batch
//! server: 0x04 QuorumStateBatch             client: ack_data          }
//! server: 0x05                              client: done
//! ```

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use futures::{AsyncWriteExt, StreamExt, future::join_all};
use itertools::Itertools;
use libp2p::PeerId;
use rand::seq::SliceRandom;
use tokio::{sync::watch, task::JoinSet, time::timeout};
use tracing::*;

use crate::{
    bridge::{PeerHost, PeerStream},
    engine::AttestationGatherer,
    error::AttestationError,
    message::{self, QuorumMessage, QuorumStateBatch, StateSyncBegin, StateSyncHeader},
    networking::{ATTESTATION_STATE, Ack, expect_ack, open_stream, read_frame, write_ack, write_frame},
};

const REQUEST: u8 = 0x01;
const BEGIN: u8 = 0x02;
const HEADER: u8 = 0x03;
const DATA: u8 = 0x04;
const END: u8 = 0x05;

fn typed_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

fn frame_body(frame: &[u8], expected: u8) -> Result<&[u8]> {
    match frame.split_first() {
        Some((kind, body)) if *kind == expected => Ok(body),
        Some((kind, _)) => Err(AttestationError::InvalidEncoding(format!(
            "expected state sync frame {expected:#04x}, got {kind:#04x}"
        ))
        .into()),
        None => Err(AttestationError::InvalidEncoding("empty state sync frame".to_owned()).into()),
    }
}

async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(AttestationError::PeerUnavailable(format!("timed out after {limit:?}")).into())
    })
}

/// Partition quorum messages into data frames of at most `max_items` each.
pub fn partition(messages: Vec<QuorumMessage>, max_items: usize) -> Vec<QuorumStateBatch> {
    messages
        .into_iter()
        .chunks(max_items.max(1))
        .into_iter()
        .map(|chunk| {
            let mut batch = QuorumStateBatch::default();
            for message in chunk {
                batch.push(message);
            }
            batch
        })
        .collect()
}

/// Serves our post-quorum attestation state to any peer that asks.
pub struct StateSyncServer {
    engine: Arc<AttestationGatherer>,
    max_items: usize,
    peer_timeout: Duration,
}

impl StateSyncServer {
    pub fn new(engine: Arc<AttestationGatherer>, max_items: usize, peer_timeout: Duration) -> Self {
        StateSyncServer {
            engine,
            max_items,
            peer_timeout,
        }
    }

    pub fn listen(
        self: &Arc<Self>,
        host: &dyn PeerHost,
        tasks: &mut JoinSet<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut incoming = host.accept(ATTESTATION_STATE)?;
        let server = Arc::clone(self);
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    next = incoming.next() => {
                        let Some((peer, stream)) = next else {
                            break;
                        };
                        tokio::spawn(server.clone().handle_stream(peer, stream));
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("stopped serving attestation state");
        });
        Ok(())
    }

    pub async fn handle_stream(self: Arc<Self>, peer: PeerId, mut stream: PeerStream) {
        match self.serve(&mut stream).await {
            Ok(items) => debug!(%peer, items, "served attestation state"),
            Err(e) => debug!(%peer, "failed to serve attestation state: {e}"),
        }
        let _ = stream.close().await;
    }

    async fn serve(&self, stream: &mut PeerStream) -> Result<usize> {
        let request = within(self.peer_timeout, read_frame(stream)).await?;
        if let Err(e) = frame_body(&request, REQUEST) {
            write_ack(stream, Ack::Error).await?;
            return Err(e);
        }

        let batches = partition(self.engine.quorum_state().await, self.max_items);
        let items = batches.iter().map(QuorumStateBatch::len).sum();
        let begin = StateSyncBegin {
            batches: u32::try_from(batches.len())?,
        };
        write_frame(stream, &typed_frame(BEGIN, &message::encode(&begin)?)).await?;
        within(self.peer_timeout, expect_ack(stream, Ack::Begin)).await?;

        for (index, batch) in batches.iter().enumerate() {
            let header = StateSyncHeader {
                index: u32::try_from(index)?,
                items: u32::try_from(batch.len())?,
            };
            write_frame(stream, &typed_frame(HEADER, &message::encode(&header)?)).await?;
            within(self.peer_timeout, expect_ack(stream, Ack::Header)).await?;
            write_frame(stream, &typed_frame(DATA, &message::encode(batch)?)).await?;
            within(self.peer_timeout, expect_ack(stream, Ack::Data)).await?;
        }

        write_frame(stream, &[END]).await?;
        within(self.peer_timeout, expect_ack(stream, Ack::Done)).await?;
        Ok(items)
    }
}

/// Ask `peer` for its post-quorum attestation state. Batches with more than `max_items` items, or whose size does not
/// match their header, abort the transfer.
pub async fn request_state(
    host: &dyn PeerHost,
    peer: PeerId,
    max_items: usize,
    peer_timeout: Duration,
) -> Result<Vec<QuorumStateBatch>> {
    let mut stream = within(peer_timeout, open_stream(host, peer, ATTESTATION_STATE)).await?;
    write_frame(&mut stream, &[REQUEST]).await?;

    let frame = within(peer_timeout, read_frame(&mut stream)).await?;
    let begin: StateSyncBegin = message::decode(frame_body(&frame, BEGIN)?)?;
    write_ack(&mut stream, Ack::Begin).await?;

    let mut batches = Vec::new();
    for expected_index in 0..begin.batches {
        let frame = within(peer_timeout, read_frame(&mut stream)).await?;
        let header: StateSyncHeader = message::decode(frame_body(&frame, HEADER)?)?;
        if header.index != expected_index {
            return Err(AttestationError::InvalidEncoding(format!(
                "expected batch {expected_index}, got {}",
                header.index
            ))
            .into());
        }
        if header.items as usize > max_items {
            return Err(AttestationError::InvalidEncoding(format!(
                "batch of {} items exceeds the limit of {max_items}",
                header.items
            ))
            .into());
        }
        write_ack(&mut stream, Ack::Header).await?;

        let frame = within(peer_timeout, read_frame(&mut stream)).await?;
        let batch: QuorumStateBatch = message::decode(frame_body(&frame, DATA)?)?;
        if batch.len() != header.items as usize {
            return Err(AttestationError::InvalidEncoding(format!(
                "header announced {} items, batch has {}",
                header.items,
                batch.len()
            ))
            .into());
        }
        write_ack(&mut stream, Ack::Data).await?;
        batches.push(batch);
    }

    let frame = within(peer_timeout, read_frame(&mut stream)).await?;
    frame_body(&frame, END)?;
    write_ack(&mut stream, Ack::Done).await?;
    let _ = stream.close().await;
    Ok(batches)
}

/// Asks a few random validator peers for their state once, shortly after start.
pub struct StateSynchroniser {
    engine: Arc<AttestationGatherer>,
    host: Arc<dyn PeerHost>,
    ask_peers: usize,
    ask_peers_delay: Duration,
    max_items: usize,
    peer_timeout: Duration,
}

impl StateSynchroniser {
    pub fn new(engine: Arc<AttestationGatherer>, host: Arc<dyn PeerHost>) -> Self {
        let config = engine.config();
        StateSynchroniser {
            ask_peers: config.ask_peers,
            ask_peers_delay: config.ask_peers_delay,
            max_items: config.max_quorum_txs_per_batch,
            peer_timeout: config.peer_timeout,
            engine,
            host,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.ask_peers_delay) => {}
            _ = shutdown.changed() => return,
        }
        let synced = self.sync_once().await;
        info!(peers = synced, "attestation state sync finished");
    }

    /// Request state from up to `ask_peers` random active validators and ingest it. Returns the number of peers that
    /// completed a transfer.
    pub async fn sync_once(&self) -> usize {
        let local = self.host.local_peer_id();
        let validators = self.engine.validators().load();
        let mut peers: Vec<_> = self
            .host
            .peers()
            .into_iter()
            .filter(|p| *p != local && validators.contains_peer(p))
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.ask_peers);
        if peers.is_empty() {
            debug!("no validator peers to sync attestation state from");
            return 0;
        }

        let results = join_all(peers.into_iter().map(|peer| async move {
            let batches =
                request_state(self.host.as_ref(), peer, self.max_items, self.peer_timeout).await?;
            let mut items = 0;
            for batch in batches {
                for message in batch.into_messages() {
                    self.engine.ingest_quorum_message(message).await;
                    items += 1;
                }
            }
            Ok::<_, anyhow::Error>((peer, items))
        }))
        .await;

        results
            .into_iter()
            .filter(|result| match result {
                Ok((peer, items)) => {
                    debug!(%peer, items, "recovered attestation state");
                    true
                }
                Err(e) => {
                    warn!("attestation state sync failed: {e}");
                    false
                }
            })
            .count()
    }
}
