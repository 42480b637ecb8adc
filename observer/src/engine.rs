//! The attestation engine.
//!
//! The engine owns one map per item kind, from fingerprint to [AttestationState]. Attestations enter the engine from
//! three places: our own observations ([AttestationGatherer::attest_observed_tx] and friends), attestations streamed
//! from peers, and attestation state recovered from peers on start. All three go through the same intake path, so
//! duplicates are absorbed by [AttestationState::add_attestation].
//!
//! Locks are always taken in this order: the map lock (only for a get-or-insert or a removal), then a single state
//! lock. No code path holds two state locks at once.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::*;

use crate::{
    attestation_state::{AttestationState, AttestationStateSummary},
    bridge::{ConsensusBridge, ConsensusEvent},
    broadcast::BatchBroadcaster,
    cfg::AttestationConfig,
    crypto::{NodePublicKey, SecretKey},
    error::AttestationError,
    item::{
        Attestation, Chain, ErrataTx, Metadata, NetworkFee, ObservedTx, SignableItem, Solvency,
        TxId, VaultPubKey,
    },
    message::{
        AttestErrataTx, AttestNetworkFee, AttestSolvency, AttestTx, AttestationBatch, QuorumErrataTx,
        QuorumMessage, QuorumNetworkFee, QuorumSolvency, QuorumTx,
    },
    metrics::Metrics,
    time::SystemTime,
    validators::{ActiveValidators, ValidatorSet},
};

/// Strict supermajority: at least two thirds of `total`. Never satisfied by an empty denominator.
pub fn has_super_majority(signers: usize, total: usize) -> bool {
    total > 0 && 3 * signers >= 2 * total
}

/// Instructions from the engine to the chain observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverCommand {
    /// One of our own observations was committed by the consensus chain.
    RemoveCommitted {
        chain: Chain,
        tx_id: TxId,
        is_final: bool,
    },
}

type SharedState<T> = Arc<AsyncMutex<AttestationState<T>>>;

struct AttestationMap<T: SignableItem> {
    states: Mutex<HashMap<T::Fingerprint, SharedState<T>>>,
}

impl<T: SignableItem> AttestationMap<T> {
    fn new() -> Self {
        AttestationMap {
            states: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert(&self, item: &T, metadata: Metadata) -> SharedState<T> {
        let fingerprint = item.fingerprint(&metadata);
        self.states
            .lock()
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(AsyncMutex::new(AttestationState::new(item.clone(), metadata))))
            .clone()
    }

    fn snapshot(&self) -> Vec<(T::Fingerprint, SharedState<T>)> {
        self.states
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    fn remove(&self, fingerprints: &[T::Fingerprint]) {
        let mut states = self.states.lock();
        for fingerprint in fingerprints {
            states.remove(fingerprint);
        }
    }

    fn retain(&self, f: impl FnMut(&T::Fingerprint, &mut SharedState<T>) -> bool) {
        self.states.lock().retain(f);
    }

    fn len(&self) -> usize {
        self.states.lock().len()
    }
}

/// Behaviour the engine needs from each item kind on top of [SignableItem].
trait Attestable: SignableItem {
    fn map(gatherer: &AttestationGatherer) -> &AttestationMap<Self>;

    fn quorum_message(&self, metadata: &Metadata, attestations: Vec<Attestation>) -> QuorumMessage;

    /// The vault whose keysign party replaces the validator set as the quorum denominator.
    fn keysign_vault(&self, _metadata: &Metadata) -> Option<&VaultPubKey> {
        None
    }
}

impl Attestable for ObservedTx {
    fn map(gatherer: &AttestationGatherer) -> &AttestationMap<Self> {
        &gatherer.observed_txs
    }

    fn quorum_message(&self, metadata: &Metadata, attestations: Vec<Attestation>) -> QuorumMessage {
        QuorumMessage::Tx(QuorumTx {
            obs_tx: self.clone(),
            inbound: metadata.inbound(),
            allow_future_observation: metadata.allow_future_observation(),
            attestations,
        })
    }

    fn keysign_vault(&self, metadata: &Metadata) -> Option<&VaultPubKey> {
        metadata
            .allow_future_observation()
            .then_some(&self.observed_pub_key)
    }
}

impl Attestable for NetworkFee {
    fn map(gatherer: &AttestationGatherer) -> &AttestationMap<Self> {
        &gatherer.network_fees
    }

    fn quorum_message(&self, _: &Metadata, attestations: Vec<Attestation>) -> QuorumMessage {
        QuorumMessage::NetworkFee(QuorumNetworkFee {
            network_fee: self.clone(),
            attestations,
        })
    }
}

impl Attestable for Solvency {
    fn map(gatherer: &AttestationGatherer) -> &AttestationMap<Self> {
        &gatherer.solvencies
    }

    fn quorum_message(&self, _: &Metadata, attestations: Vec<Attestation>) -> QuorumMessage {
        QuorumMessage::Solvency(QuorumSolvency {
            solvency: self.clone(),
            attestations,
        })
    }
}

impl Attestable for ErrataTx {
    fn map(gatherer: &AttestationGatherer) -> &AttestationMap<Self> {
        &gatherer.errata_txs
    }

    fn quorum_message(&self, _: &Metadata, attestations: Vec<Attestation>) -> QuorumMessage {
        QuorumMessage::ErrataTx(QuorumErrataTx {
            errata_tx: self.clone(),
            attestations,
        })
    }
}

struct CachedParty {
    size: usize,
    fetched: SystemTime,
}

/// Summaries of every attestation state, per kind.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AttestationStates {
    pub observed_txs: Vec<AttestationStateSummary>,
    pub network_fees: Vec<AttestationStateSummary>,
    pub solvencies: Vec<AttestationStateSummary>,
    pub errata_txs: Vec<AttestationStateSummary>,
}

pub struct AttestationGatherer {
    secret_key: SecretKey,
    pub_key: NodePublicKey,
    config: AttestationConfig,
    bridge: Arc<dyn ConsensusBridge>,
    validators: ActiveValidators,
    broadcaster: Arc<BatchBroadcaster>,
    observed_txs: AttestationMap<ObservedTx>,
    network_fees: AttestationMap<NetworkFee>,
    solvencies: AttestationMap<Solvency>,
    errata_txs: AttestationMap<ErrataTx>,
    keysign_parties: Mutex<HashMap<VaultPubKey, CachedParty>>,
    observer_commands: mpsc::UnboundedSender<ObserverCommand>,
    metrics: Metrics,
}

impl AttestationGatherer {
    pub fn new(
        secret_key: SecretKey,
        config: AttestationConfig,
        bridge: Arc<dyn ConsensusBridge>,
        validators: ActiveValidators,
        broadcaster: Arc<BatchBroadcaster>,
        observer_commands: mpsc::UnboundedSender<ObserverCommand>,
        metrics: Metrics,
    ) -> Self {
        AttestationGatherer {
            pub_key: secret_key.node_public_key(),
            secret_key,
            config,
            bridge,
            validators,
            broadcaster,
            observed_txs: AttestationMap::new(),
            network_fees: AttestationMap::new(),
            solvencies: AttestationMap::new(),
            errata_txs: AttestationMap::new(),
            keysign_parties: Mutex::new(HashMap::new()),
            observer_commands,
            metrics,
        }
    }

    pub fn public_key(&self) -> NodePublicKey {
        self.pub_key
    }

    pub fn validators(&self) -> &ActiveValidators {
        &self.validators
    }

    pub fn config(&self) -> &AttestationConfig {
        &self.config
    }

    /// Sign and record our own observation of an external transaction, then queue it for our peers.
    pub async fn attest_observed_tx(
        &self,
        obs_tx: ObservedTx,
        inbound: bool,
        allow_future_observation: bool,
    ) -> Result<()> {
        let attestation = self.sign(&obs_tx)?;
        let message = AttestTx {
            obs_tx,
            inbound,
            allow_future_observation,
            attestation,
        };
        let metadata = Metadata::observed_tx(inbound, allow_future_observation);
        if self
            .handle_attestation(message.obs_tx.clone(), metadata, message.attestation.clone())
            .await?
        {
            self.broadcaster.add_attest_tx(message);
        }
        Ok(())
    }

    pub async fn attest_network_fee(&self, network_fee: NetworkFee) -> Result<()> {
        let attestation = self.sign(&network_fee)?;
        let message = AttestNetworkFee {
            network_fee,
            attestation,
        };
        if self
            .handle_attestation(message.network_fee.clone(), Metadata::default(), message.attestation.clone())
            .await?
        {
            self.broadcaster.add_attest_network_fee(message);
        }
        Ok(())
    }

    pub async fn attest_solvency(&self, solvency: Solvency) -> Result<()> {
        let attestation = self.sign(&solvency)?;
        let message = AttestSolvency {
            solvency,
            attestation,
        };
        if self
            .handle_attestation(message.solvency.clone(), Metadata::default(), message.attestation.clone())
            .await?
        {
            self.broadcaster.add_attest_solvency(message);
        }
        Ok(())
    }

    /// Sign and record an errata. Any observed transaction states for the revoked transaction are dropped.
    pub async fn attest_errata(&self, errata_tx: ErrataTx) -> Result<()> {
        let attestation = self.sign(&errata_tx)?;
        self.observed_txs
            .retain(|key, _| !(key.chain == errata_tx.chain && key.id == errata_tx.id));
        let message = AttestErrataTx {
            errata_tx,
            attestation,
        };
        if self
            .handle_attestation(message.errata_tx.clone(), Metadata::default(), message.attestation.clone())
            .await?
        {
            self.broadcaster.add_attest_errata_tx(message);
        }
        Ok(())
    }

    fn sign<T: SignableItem>(&self, item: &T) -> Result<Attestation> {
        if !self.validators.contains_key(&self.pub_key) {
            return Err(AttestationError::NotActive(self.pub_key.to_string()).into());
        }
        Attestation::sign(item, &self.secret_key)
    }

    pub async fn handle_attest_tx(&self, message: AttestTx) -> Result<()> {
        let metadata = Metadata::observed_tx(message.inbound, message.allow_future_observation);
        self.handle_attestation(message.obs_tx, metadata, message.attestation)
            .await?;
        Ok(())
    }

    pub async fn handle_attest_network_fee(&self, message: AttestNetworkFee) -> Result<()> {
        self.handle_attestation(message.network_fee, Metadata::default(), message.attestation)
            .await?;
        Ok(())
    }

    pub async fn handle_attest_solvency(&self, message: AttestSolvency) -> Result<()> {
        self.handle_attestation(message.solvency, Metadata::default(), message.attestation)
            .await?;
        Ok(())
    }

    pub async fn handle_attest_errata_tx(&self, message: AttestErrataTx) -> Result<()> {
        self.handle_attestation(message.errata_tx, Metadata::default(), message.attestation)
            .await?;
        Ok(())
    }

    /// Handle every attestation in a batch received from a peer. Invalid attestations are dropped individually.
    pub async fn handle_batch(&self, batch: AttestationBatch) {
        for message in batch.attest_txs {
            let result = self.handle_attest_tx(message).await;
            self.log_rejection(result);
        }
        for message in batch.attest_network_fees {
            let result = self.handle_attest_network_fee(message).await;
            self.log_rejection(result);
        }
        for message in batch.attest_solvencies {
            let result = self.handle_attest_solvency(message).await;
            self.log_rejection(result);
        }
        for message in batch.attest_errata_txs {
            let result = self.handle_attest_errata_tx(message).await;
            self.log_rejection(result);
        }
    }

    fn log_rejection(&self, result: Result<()>) {
        if let Err(e) = result {
            self.metrics.rejected(&e);
            debug!("dropping attestation: {e}");
        }
    }

    /// Record `attestation` and submit the state if it now holds a supermajority. Returns whether the attestation was
    /// new.
    async fn handle_attestation<T: Attestable>(
        &self,
        item: T,
        metadata: Metadata,
        attestation: Attestation,
    ) -> Result<bool> {
        if !self.validators.contains_key(&attestation.pub_key) {
            return Err(AttestationError::NotActive(attestation.pub_key.to_string()).into());
        }

        let state = T::map(self).get_or_insert(&item, metadata);
        let mut state = state.lock().await;
        if !state.add_attestation(attestation)? {
            return Ok(false);
        }
        self.metrics.received(T::KIND.name());

        if state.quorum_attestations_sent().is_some() {
            return Ok(true);
        }
        let total = match self.quorum_denominator(state.item(), state.metadata()).await {
            Ok(total) => total,
            Err(e) => {
                warn!(kind = T::KIND.name(), "failed to determine quorum size: {e}");
                return Ok(true);
            }
        };
        if has_super_majority(state.unsent_count(), total) {
            if let Err(e) = self.submit(&mut state, true).await {
                warn!(kind = T::KIND.name(), "quorum submission failed: {e}");
            }
        }
        Ok(true)
    }

    async fn quorum_denominator<T: Attestable>(&self, item: &T, metadata: &Metadata) -> Result<usize> {
        match item.keysign_vault(metadata) {
            Some(vault) => self.keysign_party_size(vault).await,
            None => Ok(self.validators.len()),
        }
    }

    async fn keysign_party_size(&self, vault: &VaultPubKey) -> Result<usize> {
        let ttl = self.config.cached_keysign_party_ttl;
        let cached = self
            .keysign_parties
            .lock()
            .get(vault)
            .filter(|p| p.fetched.elapsed().unwrap_or_default() < ttl)
            .map(|p| p.size);
        if let Some(size) = cached {
            return Ok(size);
        }

        let size = self.bridge.keysign_party(vault).await?.len();
        self.keysign_parties.lock().insert(
            vault.clone(),
            CachedParty {
                size,
                fetched: SystemTime::now(),
            },
        );
        Ok(size)
    }

    /// Submit the unsent attestations of `state` to the consensus chain. They are only marked as sent once the
    /// submission succeeds.
    async fn submit<T: Attestable>(
        &self,
        state: &mut AttestationState<T>,
        is_quorum: bool,
    ) -> Result<()> {
        let attestations = state.unsent_attestations();
        if attestations.is_empty() {
            return Ok(());
        }
        let count = attestations.len();
        let message = state.item().quorum_message(state.metadata(), attestations);
        if let Err(e) = self.bridge.submit(message).await {
            self.metrics.consensus_rpc_failed();
            return Err(AttestationError::ConsensusRpcFailure(format!("{e:#}")).into());
        }
        state.mark_attestations_sent(is_quorum);
        self.metrics.quorum_submitted(T::KIND.name(), is_quorum);
        debug!(kind = T::KIND.name(), is_quorum, count, "submitted attestations");
        Ok(())
    }

    pub async fn refresh_validators(&self) -> Result<()> {
        let keys = self.bridge.active_validators().await?;
        self.validators.store(ValidatorSet::new(keys));
        Ok(())
    }

    /// Refresh the validator set, then walk every map: drop expired states and resend attestations that have waited
    /// too long.
    pub async fn reconcile(&self) {
        if let Err(e) = self.refresh_validators().await {
            warn!("failed to refresh active validators: {e}");
        }
        let ttl = self.config.cached_keysign_party_ttl;
        self.keysign_parties
            .lock()
            .retain(|_, party| party.fetched.elapsed().unwrap_or_default() < ttl);
        self.reconcile_kind::<ObservedTx>().await;
        self.reconcile_kind::<NetworkFee>().await;
        self.reconcile_kind::<Solvency>().await;
        self.reconcile_kind::<ErrataTx>().await;
    }

    async fn reconcile_kind<T: Attestable>(&self) {
        let map = T::map(self);
        let mut expired = Vec::new();
        for (fingerprint, state) in map.snapshot() {
            let mut state = state.lock().await;
            if state.expired_after_quorum(
                self.config.late_observe_timeout,
                self.config.non_quorum_timeout,
            ) {
                expired.push(fingerprint);
                continue;
            }
            if !state.should_send_late(self.config.min_time_between_attestations) {
                continue;
            }

            // A late send that carries a supermajority still counts as the quorum submission.
            let is_quorum = state.quorum_attestations_sent().is_none()
                && match self.quorum_denominator(state.item(), state.metadata()).await {
                    Ok(total) => has_super_majority(state.attestation_count(), total),
                    Err(e) => {
                        warn!(kind = T::KIND.name(), "failed to determine quorum size: {e}");
                        false
                    }
                };
            if let Err(e) = self.submit(&mut state, is_quorum).await {
                warn!(kind = T::KIND.name(), ?fingerprint, "late submission failed: {e}");
            }
        }
        if !expired.is_empty() {
            trace!(kind = T::KIND.name(), count = expired.len(), "pruning expired states");
            map.remove(&expired);
        }
    }

    pub fn handle_event(&self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::QuorumTxCommitted {
                obs_tx,
                attestations,
                ..
            } => {
                if !attestations.iter().any(|a| a.pub_key == self.pub_key) {
                    return;
                }
                let command = ObserverCommand::RemoveCommitted {
                    is_final: obs_tx.is_final(),
                    chain: obs_tx.tx.chain,
                    tx_id: obs_tx.tx.id,
                };
                if self.observer_commands.send(command).is_err() {
                    debug!("chain observer has stopped, dropping commit notification");
                }
            }
        }
    }

    /// Every state that has reached quorum, packaged with all of its attestations.
    pub async fn quorum_state(&self) -> Vec<QuorumMessage> {
        let mut messages = Vec::new();
        self.collect_quorum::<ObservedTx>(&mut messages).await;
        self.collect_quorum::<NetworkFee>(&mut messages).await;
        self.collect_quorum::<Solvency>(&mut messages).await;
        self.collect_quorum::<ErrataTx>(&mut messages).await;
        messages
    }

    async fn collect_quorum<T: Attestable>(&self, messages: &mut Vec<QuorumMessage>) {
        for (_, state) in T::map(self).snapshot() {
            let state = state.lock().await;
            if state.quorum_attestations_sent().is_some() {
                messages.push(
                    state
                        .item()
                        .quorum_message(state.metadata(), state.attestations().cloned().collect()),
                );
            }
        }
    }

    /// Feed attestations recovered from a peer's quorum state through the normal intake path.
    pub async fn ingest_quorum_message(&self, message: QuorumMessage) {
        match message {
            QuorumMessage::Tx(q) => {
                let metadata = Metadata::observed_tx(q.inbound, q.allow_future_observation);
                self.ingest(q.obs_tx, metadata, q.attestations).await
            }
            QuorumMessage::NetworkFee(q) => {
                self.ingest(q.network_fee, Metadata::default(), q.attestations)
                    .await
            }
            QuorumMessage::Solvency(q) => {
                self.ingest(q.solvency, Metadata::default(), q.attestations)
                    .await
            }
            QuorumMessage::ErrataTx(q) => {
                self.ingest(q.errata_tx, Metadata::default(), q.attestations)
                    .await
            }
        }
    }

    async fn ingest<T: Attestable>(&self, item: T, metadata: Metadata, attestations: Vec<Attestation>) {
        for attestation in attestations {
            let result = self
                .handle_attestation(item.clone(), metadata, attestation)
                .await
                .map(|_| ());
            self.log_rejection(result);
        }
    }

    pub async fn attestation_states(&self) -> AttestationStates {
        AttestationStates {
            observed_txs: self.summaries::<ObservedTx>().await,
            network_fees: self.summaries::<NetworkFee>().await,
            solvencies: self.summaries::<Solvency>().await,
            errata_txs: self.summaries::<ErrataTx>().await,
        }
    }

    async fn summaries<T: Attestable>(&self) -> Vec<AttestationStateSummary> {
        let mut summaries = Vec::new();
        for (_, state) in T::map(self).snapshot() {
            summaries.push(state.lock().await.state_summary());
        }
        summaries
    }

    /// Number of states held, per kind, in the order observed tx, network fee, solvency, errata.
    pub fn state_counts(&self) -> [usize; 4] {
        [
            self.observed_txs.len(),
            self.network_fees.len(),
            self.solvencies.len(),
            self.errata_txs.len(),
        ]
    }

    /// Run the reconcile loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.reconcile_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("reconcile loop stopped");
    }
}
