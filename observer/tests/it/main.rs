mod attestation;
mod events;
mod sync;

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use libp2p::PeerId;
use observer::{
    bridge::{ChainClient, VaultAddress},
    cfg::Config,
    chain_observer::deck::{TxIn, TxInItem},
    crypto::SecretKey,
    db::MemoryStore,
    item::{Chain, Coin, TxId, VaultPubKey},
    message::QuorumMessage,
    metrics::Metrics,
    node_launcher::{Collaborators, ObserverNode},
    test_util::{MemoryNetwork, MockBridge, MockChainClient},
};
use rand_chacha::ChaCha8Rng;
use tracing::*;

const VAULT: &str = "vaultpub1";
const VAULT_ADDRESS: &str = "bc1qvault";

fn btc() -> Chain {
    "BTC".parse().unwrap()
}

fn config() -> Config {
    let mut config: Config = toml::from_str(
        r#"
        [bridge]
        rpc_url = "http://localhost:1317"
        ws_url = "ws://localhost:1317"

        [observer]
        chains = ["BTC"]
        "#,
    )
    .unwrap();
    config.attestation.batch_interval = Duration::from_millis(20);
    config.attestation.ask_peers_delay = Duration::from_millis(50);
    config.attestation.peer_timeout = Duration::from_secs(2);
    config.observer.observe_interval = Duration::from_millis(20);
    config
}

/// An inbound payment into our vault, final at `height`.
fn inbound(id: &str, height: u64) -> TxIn {
    TxIn {
        chain: btc(),
        mem_pool: false,
        allow_future_observation: false,
        confirmation_required: 0,
        txs: vec![TxInItem {
            block_height: height,
            tx_id: TxId::new(id),
            sender: "bc1qsender".to_owned(),
            to: VAULT_ADDRESS.to_owned(),
            coins: vec![Coin::new("BTC.BTC", 100_000)],
            gas: vec![Coin::new("BTC.BTC", 250)],
            memo: "SWAP:ETH.ETH:0xdest".to_owned(),
            aggregator: None,
            aggregator_target: None,
            aggregator_target_limit: None,
            finalised_attested: false,
            unfinalised_attested: false,
            committed_unfinalised: false,
        }],
    }
}

pub struct TestNode {
    pub secret_key: SecretKey,
    pub peer_id: PeerId,
    pub node: ObserverNode,
    pub client: Arc<MockChainClient>,
}

impl TestNode {
    pub async fn report(&self, tx_in: TxIn) {
        let queues = self.client.queues().expect("client should be started");
        queues.txs.send(tx_in).await.unwrap();
    }

    pub async fn deck_len(&self) -> usize {
        self.node
            .observer()
            .on_deck()
            .await
            .iter()
            .map(|tx_in| tx_in.txs.len())
            .sum()
    }
}

/// Validators connected through an in-memory network, sharing one mock consensus chain.
pub struct Network {
    pub rng: Arc<Mutex<ChaCha8Rng>>,
    pub seed: u64,
    pub peers: MemoryNetwork,
    pub bridge: Arc<MockBridge>,
    pub nodes: Vec<TestNode>,
}

impl Network {
    pub async fn new(rng: Arc<Mutex<ChaCha8Rng>>, validators: usize, seed: u64) -> Network {
        let keys: Vec<_> = (0..validators)
            .map(|_| SecretKey::new_from_rng(&mut *rng.lock().unwrap()).unwrap())
            .collect();
        let bridge = Arc::new(MockBridge::new(
            keys.iter().map(SecretKey::node_public_key).collect(),
        ));
        bridge.set_vault_addresses(vec![VaultAddress {
            chain: btc(),
            address: VAULT_ADDRESS.to_owned(),
            pub_key: VaultPubKey::new(VAULT),
        }]);

        let mut network = Network {
            rng,
            seed,
            peers: MemoryNetwork::default(),
            bridge,
            nodes: Vec::new(),
        };
        for key in keys {
            network.add_node(key).await;
        }
        network
    }

    /// Launch a node with `secret_key`. It is only a validator if the consensus chain says so.
    pub async fn add_node(&mut self, secret_key: SecretKey) -> usize {
        let peer_id = secret_key.peer_id();
        let client = Arc::new(MockChainClient::new(btc()));
        let node = ObserverNode::launch(
            secret_key,
            &config(),
            Collaborators {
                bridge: self.bridge.clone(),
                events: self.bridge.clone(),
                host: self.peers.host(peer_id),
                clients: vec![client.clone() as Arc<dyn ChainClient>],
                store: Some(Arc::new(MemoryStore::default())),
            },
            Metrics::default(),
        )
        .await
        .unwrap();
        let index = self.nodes.len();
        info!(index, %peer_id, "node launched");
        self.nodes.push(TestNode {
            secret_key,
            peer_id,
            node,
            client,
        });
        index
    }

    pub fn random_key(&self) -> SecretKey {
        SecretKey::new_from_rng(&mut *self.rng.lock().unwrap()).unwrap()
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn tx_submissions(&self) -> Vec<QuorumMessage> {
        self.bridge
            .submissions()
            .into_iter()
            .filter(|m| matches!(m, QuorumMessage::Tx(_)))
            .collect()
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.node.shutdown().await.unwrap();
        }
    }
}

/// Poll `condition` until it holds, failing the test after `limit`.
pub async fn poll_until<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(limit, poll).await.is_err() {
        panic!("condition not met within {limit:?}");
    }
}
