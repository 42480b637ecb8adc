//! In-memory stand-ins for the external collaborators, used by unit and integration tests.

use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{
    AsyncRead, AsyncWrite, StreamExt,
    channel::mpsc as stream_channel,
    stream::BoxStream,
};
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    bridge::{
        ChainClient, ConsensusBridge, ConsensusEvent, EventSource, NodeStatus, ObserverQueues,
        PeerHost, PeerStream, StreamError, VaultAddress,
    },
    chain_observer::deck::{TxIn, TxInItem},
    crypto::NodePublicKey,
    item::{Chain, TxId, VaultPubKey},
    message::{QuorumErrataTx, QuorumMessage, QuorumNetworkFee, QuorumSolvency, QuorumTx},
};

/// Poll `condition` until it holds, or fail after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("condition not met after {limit:?}"))
}

/// One end of an in-memory duplex byte stream.
pub struct MemoryStream {
    outgoing: Option<stream_channel::UnboundedSender<Vec<u8>>>,
    incoming: stream_channel::UnboundedReceiver<Vec<u8>>,
    buffer: Vec<u8>,
    position: usize,
}

impl MemoryStream {
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let (a_sender, a_receiver) = stream_channel::unbounded();
        let (b_sender, b_receiver) = stream_channel::unbounded();
        (
            MemoryStream {
                outgoing: Some(a_sender),
                incoming: b_receiver,
                buffer: Vec::new(),
                position: 0,
            },
            MemoryStream {
                outgoing: Some(b_sender),
                incoming: a_receiver,
                buffer: Vec::new(),
                position: 0,
            },
        )
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if this.position < this.buffer.len() {
                let n = buf.len().min(this.buffer.len() - this.position);
                buf[..n].copy_from_slice(&this.buffer[this.position..this.position + n]);
                this.position += n;
                return Poll::Ready(Ok(n));
            }
            match ready!(this.incoming.poll_next_unpin(cx)) {
                Some(chunk) => {
                    this.buffer = chunk;
                    this.position = 0;
                }
                None => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(outgoing) = &self.outgoing else {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        };
        if outgoing.unbounded_send(buf.to_vec()).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outgoing = None;
        Poll::Ready(Ok(()))
    }
}

type Handler = mpsc::UnboundedSender<(PeerId, PeerStream)>;

#[derive(Default)]
struct HostEntry {
    handlers: HashMap<StreamProtocol, Handler>,
    connected: bool,
}

/// A fully connected network of in-memory hosts.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hosts: Arc<Mutex<HashMap<PeerId, HostEntry>>>,
}

impl MemoryNetwork {
    /// The host for `peer_id`, joining it to the network if it is new.
    pub fn host(&self, peer_id: PeerId) -> Arc<MemoryHost> {
        self.hosts
            .lock()
            .entry(peer_id)
            .or_insert_with(|| HostEntry {
                connected: true,
                ..Default::default()
            });
        Arc::new(MemoryHost {
            peer_id,
            network: self.clone(),
        })
    }

    /// Cut `peer_id` off from every other host. Its protocol handlers are kept.
    pub fn disconnect(&self, peer_id: PeerId) {
        if let Some(entry) = self.hosts.lock().get_mut(&peer_id) {
            entry.connected = false;
        }
    }

    pub fn reconnect(&self, peer_id: PeerId) {
        if let Some(entry) = self.hosts.lock().get_mut(&peer_id) {
            entry.connected = true;
        }
    }
}

pub struct MemoryHost {
    peer_id: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerHost for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn peers(&self) -> Vec<PeerId> {
        let hosts = self.network.hosts.lock();
        if !hosts.get(&self.peer_id).is_some_and(|h| h.connected) {
            return vec![];
        }
        hosts
            .iter()
            .filter(|(peer, entry)| **peer != self.peer_id && entry.connected)
            .map(|(peer, _)| *peer)
            .collect()
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream, StreamError> {
        let handler = {
            let hosts = self.network.hosts.lock();
            let local_connected = hosts.get(&self.peer_id).is_some_and(|h| h.connected);
            let Some(remote) = hosts.get(&peer).filter(|h| h.connected && local_connected) else {
                return Err(StreamError::Unavailable(format!("{peer} is not connected")));
            };
            remote
                .handlers
                .get(&protocol)
                .cloned()
                .ok_or(StreamError::ProtocolNotSupported)?
        };
        let (local, remote) = MemoryStream::pair();
        handler
            .send((self.peer_id, Box::new(remote)))
            .map_err(|_| StreamError::ProtocolNotSupported)?;
        Ok(Box::new(local))
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<BoxStream<'static, (PeerId, PeerStream)>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut hosts = self.network.hosts.lock();
        let entry = hosts.entry(self.peer_id).or_default();
        if entry.handlers.get(&protocol).is_some_and(|h| !h.is_closed()) {
            return Err(anyhow!("{protocol} is already being accepted"));
        }
        entry.handlers.insert(protocol, sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

#[derive(Default)]
struct BridgeState {
    active: Vec<NodePublicKey>,
    inactive_nodes: HashSet<NodePublicKey>,
    keysign_parties: HashMap<VaultPubKey, Vec<NodePublicKey>>,
    vault_addresses: Vec<VaultAddress>,
    submissions: Vec<QuorumMessage>,
    failing_submissions: usize,
    failing_queries: bool,
    subscribers: Vec<mpsc::UnboundedSender<ConsensusEvent>>,
}

/// A scriptable consensus chain. Also serves as the event source.
#[derive(Default)]
pub struct MockBridge {
    state: Mutex<BridgeState>,
    keysign_party_calls: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl MockBridge {
    pub fn new(active: Vec<NodePublicKey>) -> Self {
        MockBridge {
            state: Mutex::new(BridgeState {
                active,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn set_active_validators(&self, active: Vec<NodePublicKey>) {
        self.state.lock().active = active;
    }

    pub fn set_node_inactive(&self, key: NodePublicKey) {
        self.state.lock().inactive_nodes.insert(key);
    }

    pub fn set_keysign_party(&self, vault: VaultPubKey, party: Vec<NodePublicKey>) {
        self.state.lock().keysign_parties.insert(vault, party);
    }

    pub fn set_vault_addresses(&self, addresses: Vec<VaultAddress>) {
        self.state.lock().vault_addresses = addresses;
    }

    /// Make the next `n` submissions fail. Failed submissions are not recorded.
    pub fn fail_next_submissions(&self, n: usize) {
        self.state.lock().failing_submissions = n;
    }

    /// Make every query fail until called again with `false`.
    pub fn fail_queries(&self, failing: bool) {
        self.state.lock().failing_queries = failing;
    }

    pub fn submissions(&self) -> Vec<QuorumMessage> {
        self.state.lock().submissions.clone()
    }

    pub fn keysign_party_calls(&self) -> usize {
        self.keysign_party_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions opened so far.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every open subscription.
    pub fn publish(&self, event: ConsensusEvent) {
        self.state
            .lock()
            .subscribers
            .retain(|s| s.send(event.clone()).is_ok());
    }

    /// End every open subscription, as if the connection dropped.
    pub fn drop_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    fn query<T>(&self, f: impl FnOnce(&BridgeState) -> T) -> Result<T> {
        let state = self.state.lock();
        if state.failing_queries {
            return Err(anyhow!("consensus chain unreachable"));
        }
        Ok(f(&state))
    }

    fn record(&self, message: QuorumMessage) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(anyhow!("submission rejected"));
        }
        state.submissions.push(message);
        Ok(())
    }
}

#[async_trait]
impl ConsensusBridge for MockBridge {
    async fn node_status(&self, pub_key: &NodePublicKey) -> Result<NodeStatus> {
        self.query(|s| NodeStatus {
            pub_key: *pub_key,
            active: s.active.contains(pub_key) && !s.inactive_nodes.contains(pub_key),
        })
    }

    async fn active_validators(&self) -> Result<Vec<NodePublicKey>> {
        self.query(|s| s.active.clone())
    }

    async fn keysign_party(&self, vault: &VaultPubKey) -> Result<Vec<NodePublicKey>> {
        self.keysign_party_calls.fetch_add(1, Ordering::SeqCst);
        self.query(|s| s.keysign_parties.get(vault).cloned().unwrap_or_default())
    }

    async fn vault_addresses(&self) -> Result<Vec<VaultAddress>> {
        self.query(|s| s.vault_addresses.clone())
    }

    async fn send_quorum_tx(&self, quorum: QuorumTx) -> Result<()> {
        self.record(QuorumMessage::Tx(quorum))
    }

    async fn send_quorum_network_fee(&self, quorum: QuorumNetworkFee) -> Result<()> {
        self.record(QuorumMessage::NetworkFee(quorum))
    }

    async fn send_quorum_solvency(&self, quorum: QuorumSolvency) -> Result<()> {
        self.record(QuorumMessage::Solvency(quorum))
    }

    async fn send_quorum_errata(&self, quorum: QuorumErrataTx) -> Result<()> {
        self.record(QuorumMessage::ErrataTx(quorum))
    }
}

#[async_trait]
impl EventSource for MockBridge {
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ConsensusEvent>>> {
        let mut state = self.state.lock();
        if state.failing_queries {
            return Err(anyhow!("consensus chain unreachable"));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(sender);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(UnboundedReceiverStream::new(receiver).map(Ok).boxed())
    }
}

/// A chain client whose confirmations are set by the test.
pub struct MockChainClient {
    chain: Chain,
    ready: AtomicBool,
    confirmations: AtomicU64,
    queues: Mutex<Option<ObserverQueues>>,
    observed: Mutex<Vec<(TxId, u64)>>,
    stopped: AtomicBool,
}

impl MockChainClient {
    pub fn new(chain: Chain) -> Self {
        MockChainClient {
            chain,
            ready: AtomicBool::new(true),
            confirmations: AtomicU64::new(1),
            queues: Mutex::new(None),
            observed: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_confirmations(&self, confirmations: u64) {
        self.confirmations.store(confirmations, Ordering::SeqCst);
    }

    /// The queues handed over by the observer on start.
    pub fn queues(&self) -> Option<ObserverQueues> {
        self.queues.lock().clone()
    }

    pub fn observed_tx_ins(&self) -> Vec<(TxId, u64)> {
        self.observed.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain(&self) -> Chain {
        self.chain.clone()
    }

    async fn start(&self, queues: ObserverQueues) -> Result<()> {
        *self.queues.lock() = Some(queues);
        Ok(())
    }

    async fn confirmation_count(&self, _: &TxIn) -> Result<u64> {
        Ok(self.confirmations.load(Ordering::SeqCst))
    }

    async fn confirmation_count_ready(&self, _: &TxIn) -> Result<bool> {
        Ok(self.ready.load(Ordering::SeqCst))
    }

    fn on_observed_tx_in(&self, item: &TxInItem, height: u64) {
        self.observed.lock().push((item.tx_id.clone(), height));
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
