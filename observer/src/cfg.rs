use std::{collections::HashSet, time::Duration};

use anyhow::{Result, anyhow};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::item::Chain;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The port to listen for P2P messages on. Optional - If not provided a random port will be used.
    #[serde(default)]
    pub p2p_port: u16,
    /// External address for this node. This is the address at which it can be reached by other validators. This should
    /// include the P2P port.
    #[serde(default)]
    pub external_address: Option<Multiaddr>,
    /// The address of another node to dial when this node starts. To join the mesh, a validator must know about at
    /// least one other validator.
    #[serde(default)]
    pub bootstrap_address: Option<(PeerId, Multiaddr)>,
    /// The base address of the OTLP collector. If not set, metrics will not be exported.
    #[serde(default)]
    pub otlp_collector_endpoint: Option<String>,
    /// The location of the observer's persistent data. If not set, the deck is only kept in memory.
    #[serde(default)]
    pub data_dir: Option<String>,
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub attestation: AttestationConfig,
    pub observer: ObserverConfig,
    /// Status API. Disabled if not set.
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

impl Config {
    /// Reject configurations the observer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let attestation = &self.attestation;
        if attestation.max_batch_size == 0 {
            return Err(anyhow!("`attestation.max_batch_size` must be greater than zero"));
        }
        if attestation.peer_concurrent_sends == 0 {
            return Err(anyhow!(
                "`attestation.peer_concurrent_sends` must be greater than zero"
            ));
        }
        if attestation.max_quorum_txs_per_batch == 0 {
            return Err(anyhow!(
                "`attestation.max_quorum_txs_per_batch` must be greater than zero"
            ));
        }
        for (name, duration) in [
            ("reconcile_interval", attestation.reconcile_interval),
            ("batch_interval", attestation.batch_interval),
            ("ask_peers_delay", attestation.ask_peers_delay),
        ] {
            if duration.is_zero() {
                return Err(anyhow!("`attestation.{name}` must be non-zero"));
            }
        }
        if self.observer.observe_interval.is_zero() {
            return Err(anyhow!("`observer.observe_interval` must be non-zero"));
        }
        self.observer.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// HTTP JSON-RPC endpoint of the consensus chain.
    pub rpc_url: String,
    /// WebSocket endpoint used for the event subscription.
    pub ws_url: String,
    #[serde(default = "request_timeout_default")]
    pub request_timeout: Duration,
}

pub fn request_timeout_default() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationConfig {
    /// Pace of pruning and late resends.
    #[serde(default = "reconcile_interval_default")]
    pub reconcile_interval: Duration,
    /// How long after quorum late attestations are still accepted and forwarded.
    #[serde(default = "late_observe_timeout_default")]
    pub late_observe_timeout: Duration,
    /// Maximum retention for items that never reach quorum.
    #[serde(default = "non_quorum_timeout_default")]
    pub non_quorum_timeout: Duration,
    /// Lower bound on the gap between two submissions for the same item.
    #[serde(default = "min_time_between_attestations_default")]
    pub min_time_between_attestations: Duration,
    /// Number of peers asked for their attestation state on start.
    #[serde(default = "ask_peers_default")]
    pub ask_peers: usize,
    #[serde(default = "ask_peers_delay_default")]
    pub ask_peers_delay: Duration,
    #[serde(default = "batch_interval_default")]
    pub batch_interval: Duration,
    /// Maximum number of attestations of each kind in one outbound batch.
    #[serde(default = "max_batch_size_default")]
    pub max_batch_size: usize,
    #[serde(default = "peer_timeout_default")]
    pub peer_timeout: Duration,
    /// Maximum number of sends to a single peer in flight at once.
    #[serde(default = "peer_concurrent_sends_default")]
    pub peer_concurrent_sends: usize,
    #[serde(default = "max_quorum_txs_per_batch_default")]
    pub max_quorum_txs_per_batch: usize,
    #[serde(default = "cached_keysign_party_ttl_default")]
    pub cached_keysign_party_ttl: Duration,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        AttestationConfig {
            reconcile_interval: reconcile_interval_default(),
            late_observe_timeout: late_observe_timeout_default(),
            non_quorum_timeout: non_quorum_timeout_default(),
            min_time_between_attestations: min_time_between_attestations_default(),
            ask_peers: ask_peers_default(),
            ask_peers_delay: ask_peers_delay_default(),
            batch_interval: batch_interval_default(),
            max_batch_size: max_batch_size_default(),
            peer_timeout: peer_timeout_default(),
            peer_concurrent_sends: peer_concurrent_sends_default(),
            max_quorum_txs_per_batch: max_quorum_txs_per_batch_default(),
            cached_keysign_party_ttl: cached_keysign_party_ttl_default(),
        }
    }
}

pub fn reconcile_interval_default() -> Duration {
    Duration::from_secs(15)
}

pub fn late_observe_timeout_default() -> Duration {
    Duration::from_secs(2 * 60)
}

pub fn non_quorum_timeout_default() -> Duration {
    Duration::from_secs(10 * 60 * 60)
}

pub fn min_time_between_attestations_default() -> Duration {
    Duration::from_secs(30)
}

pub fn ask_peers_default() -> usize {
    3
}

pub fn ask_peers_delay_default() -> Duration {
    Duration::from_secs(5)
}

pub fn batch_interval_default() -> Duration {
    Duration::from_secs(2)
}

pub fn max_batch_size_default() -> usize {
    100
}

pub fn peer_timeout_default() -> Duration {
    Duration::from_secs(10)
}

pub fn peer_concurrent_sends_default() -> usize {
    4
}

pub fn max_quorum_txs_per_batch_default() -> usize {
    100
}

pub fn cached_keysign_party_ttl_default() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObserverConfig {
    /// External chains to observe.
    pub chains: Vec<Chain>,
    /// How often the deck is walked.
    #[serde(default = "observe_interval_default")]
    pub observe_interval: Duration,
    #[serde(default = "signed_tx_out_cache_size_default")]
    pub signed_tx_out_cache_size: usize,
}

impl ObserverConfig {
    fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(anyhow!("`observer.chains` must list at least one chain"));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain) {
                return Err(anyhow!("chain {chain} is listed more than once"));
            }
        }
        if self.signed_tx_out_cache_size == 0 {
            return Err(anyhow!(
                "`observer.signed_tx_out_cache_size` must be greater than zero"
            ));
        }
        Ok(())
    }
}

pub fn observe_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn signed_tx_out_cache_size_default() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// The port to listen for JSON-RPC requests on.
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [bridge]
        rpc_url = "http://localhost:1317"
        ws_url = "ws://localhost:1317"

        [observer]
        chains = ["BTC", "ETH"]
    "#;

    #[test]
    fn defaults_are_applied() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.attestation.reconcile_interval, Duration::from_secs(15));
        assert_eq!(config.attestation.non_quorum_timeout, Duration::from_secs(36000));
        assert_eq!(config.attestation.max_batch_size, 100);
        assert_eq!(config.observer.signed_tx_out_cache_size, 10_000);
        assert!(config.api.is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let toml = format!("{MINIMAL}\nunknown = 1\n");
        assert!(toml::from_str::<Config>(&toml).is_err());
    }

    #[test]
    fn invalid_chains_are_rejected() {
        let toml = MINIMAL.replace(r#"["BTC", "ETH"]"#, r#"["btc"]"#);
        assert!(toml::from_str::<Config>(&toml).is_err());

        let toml = MINIMAL.replace(r#"["BTC", "ETH"]"#, r#"["BTC", "BTC"]"#);
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());

        let toml = MINIMAL.replace(r#"["BTC", "ETH"]"#, "[]");
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let toml = format!("{MINIMAL}\n[attestation]\nmax_batch_size = 0\n");
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }
}
