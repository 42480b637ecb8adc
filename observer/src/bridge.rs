//! Interfaces to the collaborators the attestation core depends on but does not implement: the consensus chain, the
//! external chain clients, the peer host and the key-value store.

use anyhow::Result;
use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, stream::BoxStream};
use libp2p::{PeerId, StreamProtocol};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    chain_observer::deck::{ErrataBlock, TxIn, TxInItem},
    crypto::NodePublicKey,
    item::{Attestation, Chain, NetworkFee, ObservedTx, Solvency, VaultPubKey},
    message::{QuorumErrataTx, QuorumMessage, QuorumNetworkFee, QuorumSolvency, QuorumTx},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub pub_key: NodePublicKey,
    pub active: bool,
}

/// An address controlled by a vault on an external chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultAddress {
    pub chain: Chain,
    pub address: String,
    pub pub_key: VaultPubKey,
}

/// Queries and submissions against the consensus chain. Implementations must be safe to share between tasks.
#[async_trait]
pub trait ConsensusBridge: Send + Sync + 'static {
    async fn node_status(&self, pub_key: &NodePublicKey) -> Result<NodeStatus>;

    async fn active_validators(&self) -> Result<Vec<NodePublicKey>>;

    async fn keysign_party(&self, vault: &VaultPubKey) -> Result<Vec<NodePublicKey>>;

    async fn vault_addresses(&self) -> Result<Vec<VaultAddress>>;

    async fn send_quorum_tx(&self, quorum: QuorumTx) -> Result<()>;

    async fn send_quorum_network_fee(&self, quorum: QuorumNetworkFee) -> Result<()>;

    async fn send_quorum_solvency(&self, quorum: QuorumSolvency) -> Result<()>;

    async fn send_quorum_errata(&self, quorum: QuorumErrataTx) -> Result<()>;

    async fn submit(&self, message: QuorumMessage) -> Result<()> {
        match message {
            QuorumMessage::Tx(q) => self.send_quorum_tx(q).await,
            QuorumMessage::NetworkFee(q) => self.send_quorum_network_fee(q).await,
            QuorumMessage::Solvency(q) => self.send_quorum_solvency(q).await,
            QuorumMessage::ErrataTx(q) => self.send_quorum_errata(q).await,
        }
    }
}

/// Events published by the consensus chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsensusEvent {
    QuorumTxCommitted {
        obs_tx: ObservedTx,
        inbound: bool,
        attestations: Vec<Attestation>,
    },
}

#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open a new subscription. The stream ends when the underlying connection is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ConsensusEvent>>>;
}

/// The queues a chain client pushes its observations into.
#[derive(Clone, Debug)]
pub struct ObserverQueues {
    pub txs: mpsc::Sender<TxIn>,
    pub errata: mpsc::Sender<ErrataBlock>,
    pub solvencies: mpsc::Sender<Solvency>,
    pub network_fees: mpsc::Sender<NetworkFee>,
}

/// A client for one external chain.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    fn chain(&self) -> Chain;

    async fn start(&self, queues: ObserverQueues) -> Result<()>;

    /// The number of confirmations `txs` needs before it is final.
    async fn confirmation_count(&self, txs: &TxIn) -> Result<u64>;

    async fn confirmation_count_ready(&self, txs: &TxIn) -> Result<bool>;

    /// Called after an inbound item was attested at `height`.
    fn on_observed_tx_in(&self, item: &TxInItem, height: u64);

    async fn stop(&self);
}

/// A byte-level key-value store.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn close(&self) -> Result<()>;
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// A bidirectional stream to a peer, speaking a single protocol.
pub type PeerStream = Box<dyn AsyncReadWrite + Send + Unpin>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("protocol not supported by peer")]
    ProtocolNotSupported,
    #[error("peer unavailable: {0}")]
    Unavailable(String),
}

/// The peer-to-peer host validators talk to each other through.
#[async_trait]
pub trait PeerHost: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Peers we currently have a connection to.
    fn peers(&self) -> Vec<PeerId>;

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream, StreamError>;

    /// Start accepting inbound streams for `protocol`. May be called at most once per protocol.
    fn accept(&self, protocol: StreamProtocol) -> Result<BoxStream<'static, (PeerId, PeerStream)>>;
}
