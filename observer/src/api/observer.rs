//! The `observer` namespace.

use std::sync::Arc;

use anyhow::Result;
use jsonrpsee::{RpcModule, types::Params};

use super::ApiContext;
use crate::{chain_observer::deck::TxIn, engine::AttestationStates};

pub fn rpc_module(context: ApiContext) -> RpcModule<ApiContext> {
    super::declare_module!(
        context,
        [
            ("observer_peerId", peer_id),
            ("observer_attestationState", attestation_state),
            ("observer_onDeck", on_deck),
        ],
    )
}

async fn peer_id(_: Params<'static>, context: Arc<ApiContext>) -> Result<String> {
    Ok(context.peer_id.to_string())
}

async fn attestation_state(_: Params<'static>, context: Arc<ApiContext>) -> Result<AttestationStates> {
    Ok(context.engine.attestation_states().await)
}

async fn on_deck(_: Params<'static>, context: Arc<ApiContext>) -> Result<Vec<TxIn>> {
    Ok(context.observer.on_deck().await)
}
