pub mod api;
pub mod attestation_state;
pub mod bridge;
pub mod broadcast;
pub mod cfg;
pub mod chain_observer;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod item;
pub mod message;
pub mod metrics;
pub mod networking;
pub mod node_launcher;
pub mod p2p_node;
pub mod rpc_bridge;
pub mod sync;
pub mod test_util;
pub mod time;
pub mod validators;
