//! The consensus chain, reached over JSON-RPC.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use jsonrpsee::{
    core::client::{ClientT, Subscription, SubscriptionClientT},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
    ws_client::WsClientBuilder,
};

use crate::{
    bridge::{ConsensusBridge, ConsensusEvent, EventSource, NodeStatus, VaultAddress},
    cfg::BridgeConfig,
    crypto::NodePublicKey,
    item::VaultPubKey,
    message::{QuorumErrataTx, QuorumNetworkFee, QuorumSolvency, QuorumTx},
};

pub struct RpcBridge {
    client: HttpClient,
    ws_url: String,
    request_timeout: Duration,
}

impl RpcBridge {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(config.request_timeout)
            .build(&config.rpc_url)
            .with_context(|| format!("invalid consensus RPC url {}", config.rpc_url))?;
        Ok(RpcBridge {
            client,
            ws_url: config.ws_url.clone(),
            request_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl ConsensusBridge for RpcBridge {
    async fn node_status(&self, pub_key: &NodePublicKey) -> Result<NodeStatus> {
        Ok(self
            .client
            .request("consensus_nodeStatus", rpc_params![pub_key])
            .await?)
    }

    async fn active_validators(&self) -> Result<Vec<NodePublicKey>> {
        Ok(self
            .client
            .request("consensus_activeValidators", rpc_params![])
            .await?)
    }

    async fn keysign_party(&self, vault: &VaultPubKey) -> Result<Vec<NodePublicKey>> {
        Ok(self
            .client
            .request("consensus_keysignParty", rpc_params![vault])
            .await?)
    }

    async fn vault_addresses(&self) -> Result<Vec<VaultAddress>> {
        Ok(self
            .client
            .request("consensus_vaultAddresses", rpc_params![])
            .await?)
    }

    async fn send_quorum_tx(&self, quorum: QuorumTx) -> Result<()> {
        Ok(self
            .client
            .request("consensus_sendQuorumTx", rpc_params![quorum])
            .await?)
    }

    async fn send_quorum_network_fee(&self, quorum: QuorumNetworkFee) -> Result<()> {
        Ok(self
            .client
            .request("consensus_sendQuorumNetworkFee", rpc_params![quorum])
            .await?)
    }

    async fn send_quorum_solvency(&self, quorum: QuorumSolvency) -> Result<()> {
        Ok(self
            .client
            .request("consensus_sendQuorumSolvency", rpc_params![quorum])
            .await?)
    }

    async fn send_quorum_errata(&self, quorum: QuorumErrataTx) -> Result<()> {
        Ok(self
            .client
            .request("consensus_sendQuorumErrata", rpc_params![quorum])
            .await?)
    }
}

#[async_trait]
impl EventSource for RpcBridge {
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ConsensusEvent>>> {
        let client = WsClientBuilder::default()
            .request_timeout(self.request_timeout)
            .build(&self.ws_url)
            .await
            .with_context(|| format!("failed to connect to {}", self.ws_url))?;
        let subscription: Subscription<ConsensusEvent> = client
            .subscribe(
                "consensus_subscribeEvents",
                rpc_params![],
                "consensus_unsubscribeEvents",
            )
            .await?;
        // The subscription ends when its client is dropped, so the stream owns the client.
        Ok(subscription
            .map(move |event| {
                let _ = &client;
                Ok(event?)
            })
            .boxed())
    }
}
