//! The chain observer sits between the external chain clients and the attestation engine.
//!
//! Clients push reported transactions, errata, solvency reports and network fees into four queues. Transactions are
//! parked on the deck and attested once they touch one of our vaults: a non-final observation as soon as the client
//! allows it, then a final observation once the batch has enough confirmations. The deck is persisted after every
//! change so a restart does not lose pending work.

pub mod deck;
pub mod pool_addresses;
pub mod signed_outbound;

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tracing::*;

use self::{
    deck::{ErrataBlock, OnDeck, TxIn, TxInItem},
    pool_addresses::{Classification, PoolAddresses},
    signed_outbound::SignedOutboundCache,
};
use crate::{
    bridge::{ChainClient, ConsensusBridge, KeyValueStore, ObserverQueues},
    cfg::ObserverConfig,
    engine::{AttestationGatherer, ObserverCommand},
    error::AttestationError,
    item::{Chain, ErrataTx, NetworkFee, ObservedTx, Solvency, TxId},
    message,
    metrics::Metrics,
};

const ON_DECK_KEY: &[u8] = b"observer/ondeck/v1";
const QUEUE_CAPACITY: usize = 1024;

fn persistence_failure(e: anyhow::Error) -> anyhow::Error {
    AttestationError::PersistenceFailure(format!("{e:#}")).into()
}

fn read_deck(store: &dyn KeyValueStore) -> Result<Option<OnDeck>> {
    let Some(bytes) = store.get(ON_DECK_KEY).map_err(persistence_failure)? else {
        return Ok(None);
    };
    message::decode(&bytes).map(Some).map_err(persistence_failure)
}

fn write_deck(store: &dyn KeyValueStore, deck: &OnDeck) -> Result<()> {
    message::encode(deck)
        .and_then(|bytes| store.put(ON_DECK_KEY, &bytes))
        .map_err(persistence_failure)
}

fn load_deck(store: &dyn KeyValueStore, metrics: &Metrics) -> OnDeck {
    match read_deck(store) {
        Ok(Some(deck)) => {
            info!(items = deck.len(), "restored deck");
            deck
        }
        Ok(None) => OnDeck::default(),
        Err(e) => {
            metrics.persistence_failed(&e);
            warn!("starting with an empty deck: {e}");
            OnDeck::default()
        }
    }
}

async fn dispatch<T, F, Fut>(
    mut queue: mpsc::Receiver<T>,
    mut shutdown: watch::Receiver<bool>,
    mut handle: F,
) where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(item) => handle(item).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

pub struct ChainObserver {
    engine: Arc<AttestationGatherer>,
    clients: HashMap<Chain, Arc<dyn ChainClient>>,
    pool: PoolAddresses,
    signed_outbound: SignedOutboundCache,
    deck: AsyncMutex<OnDeck>,
    store: Option<Arc<dyn KeyValueStore>>,
    observe_interval: Duration,
    metrics: Metrics,
}

impl ChainObserver {
    /// Create an observer for `clients`. If a store is given, the deck persisted in it is restored.
    pub fn new(
        engine: Arc<AttestationGatherer>,
        bridge: Arc<dyn ConsensusBridge>,
        clients: Vec<Arc<dyn ChainClient>>,
        store: Option<Arc<dyn KeyValueStore>>,
        config: &ObserverConfig,
        metrics: Metrics,
    ) -> Self {
        let deck = store
            .as_deref()
            .map(|store| load_deck(store, &metrics))
            .unwrap_or_default();
        ChainObserver {
            engine,
            clients: clients.into_iter().map(|c| (c.chain(), c)).collect(),
            pool: PoolAddresses::new(bridge),
            signed_outbound: SignedOutboundCache::new(config.signed_tx_out_cache_size),
            deck: AsyncMutex::new(deck),
            store,
            observe_interval: config.observe_interval,
            metrics,
        }
    }

    /// Start every chain client and spawn the ingress dispatchers and the deck loop into `tasks`.
    pub async fn start(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        commands: mpsc::UnboundedReceiver<ObserverCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (txs, tx_queue) = mpsc::channel(QUEUE_CAPACITY);
        let (errata, errata_queue) = mpsc::channel(QUEUE_CAPACITY);
        let (solvencies, solvency_queue) = mpsc::channel(QUEUE_CAPACITY);
        let (network_fees, network_fee_queue) = mpsc::channel(QUEUE_CAPACITY);
        let queues = ObserverQueues {
            txs,
            errata,
            solvencies,
            network_fees,
        };
        for (chain, client) in &self.clients {
            client
                .start(queues.clone())
                .await
                .with_context(|| format!("failed to start {chain} client"))?;
            info!(%chain, "chain client started");
        }

        let observer = self.clone();
        tasks.spawn(dispatch(tx_queue, shutdown.clone(), move |tx_in| {
            let observer = observer.clone();
            async move { observer.add_tx_in(tx_in).await }
        }));
        let observer = self.clone();
        tasks.spawn(dispatch(errata_queue, shutdown.clone(), move |block| {
            let observer = observer.clone();
            async move { observer.handle_errata(block).await }
        }));
        let observer = self.clone();
        tasks.spawn(dispatch(solvency_queue, shutdown.clone(), move |solvency| {
            let observer = observer.clone();
            async move { observer.handle_solvency(solvency).await }
        }));
        let observer = self.clone();
        tasks.spawn(dispatch(network_fee_queue, shutdown.clone(), move |fee| {
            let observer = observer.clone();
            async move { observer.handle_network_fee(fee).await }
        }));
        tasks.spawn(self.clone().run(commands, shutdown));
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<ObserverCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.observe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.observe_once().await,
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = shutdown.changed() => break,
            }
        }
        for client in self.clients.values() {
            client.stop().await;
        }
        self.persist(&*self.deck.lock().await);
        debug!("chain observer stopped");
    }

    /// Park a reported batch on the deck.
    pub async fn add_tx_in(&self, mut tx_in: TxIn) {
        let Some(client) = self.clients.get(&tx_in.chain) else {
            warn!(chain = %tx_in.chain, "dropping transactions for a chain we do not observe");
            return;
        };
        if !tx_in.mem_pool {
            match client.confirmation_count(&tx_in).await {
                Ok(required) => tx_in.confirmation_required = required,
                Err(e) => debug!(chain = %tx_in.chain, "keeping reported confirmation count: {e}"),
            }
        }
        let mut deck = self.deck.lock().await;
        if deck.add(tx_in) {
            self.persist(&deck);
        }
    }

    /// Drop revoked transactions from the deck, then attest to the errata.
    pub async fn handle_errata(&self, block: ErrataBlock) {
        {
            let mut deck = self.deck.lock().await;
            let removed: usize = block
                .txs
                .iter()
                .map(|id| deck.remove_tx(&block.chain, id))
                .sum();
            if removed > 0 {
                debug!(chain = %block.chain, height = block.height, removed, "purged revoked transactions");
                self.persist(&deck);
            }
        }
        for id in block.txs {
            let errata = ErrataTx {
                chain: block.chain.clone(),
                id,
            };
            if let Err(e) = self.engine.attest_errata(errata).await {
                warn!(chain = %block.chain, "failed to attest errata: {e}");
            }
        }
    }

    pub async fn handle_solvency(&self, solvency: Solvency) {
        if let Err(e) = self.engine.attest_solvency(solvency).await {
            debug!("failed to attest solvency: {e}");
        }
    }

    pub async fn handle_network_fee(&self, network_fee: NetworkFee) {
        if let Err(e) = self.engine.attest_network_fee(network_fee).await {
            debug!("failed to attest network fee: {e}");
        }
    }

    pub async fn handle_command(&self, command: ObserverCommand) {
        match command {
            ObserverCommand::RemoveCommitted {
                chain,
                tx_id,
                is_final,
            } => {
                let mut deck = self.deck.lock().await;
                let changed = if is_final {
                    deck.remove_tx(&chain, &tx_id)
                } else {
                    deck.mark_committed_unfinalised(&chain, &tx_id)
                };
                if changed > 0 {
                    debug!(%chain, %tx_id, is_final, "our observation was committed");
                    self.persist(&deck);
                }
            }
        }
    }

    /// Record an outbound transaction we signed ourselves, so we do not attest to our own outbound again.
    pub fn mark_signed_outbound(&self, tx_id: TxId) {
        self.signed_outbound.insert(tx_id);
    }

    pub async fn on_deck(&self) -> Vec<TxIn> {
        self.deck.lock().await.entries().to_vec()
    }

    /// Refresh the vault addresses and walk the deck once.
    pub async fn observe_once(&self) {
        self.pool.refresh().await;
        if self.pool.is_empty() {
            debug!("no vault addresses known yet");
            return;
        }
        let mut deck = self.deck.lock().await;
        let mut changed = false;
        for tx_in in deck.entries_mut() {
            changed |= self.observe_tx_in(tx_in).await;
        }
        if changed {
            deck.prune();
            self.persist(&deck);
        }
    }

    async fn observe_tx_in(&self, tx_in: &mut TxIn) -> bool {
        let Some(client) = self.clients.get(&tx_in.chain) else {
            return false;
        };
        let ready = match client.confirmation_count_ready(tx_in).await {
            Ok(ready) => ready,
            Err(e) => {
                debug!(chain = %tx_in.chain, "failed to check confirmations: {e}");
                return false;
            }
        };

        let before = tx_in.txs.len();
        let chain = tx_in.chain.clone();
        tx_in.txs.retain(|item| {
            let classification = self.pool.classify(&chain, &item.sender, &item.to);
            classification.inbound.is_some() || classification.outbound.is_some()
        });
        let mut changed = tx_in.txs.len() != before;

        for item in tx_in.txs.iter_mut() {
            let classification = self.pool.classify(&chain, &item.sender, &item.to);
            if ready {
                if !item.finalised_attested
                    && self
                        .observe_final(client.as_ref(), &chain, item, &classification)
                        .await
                {
                    item.finalised_attested = true;
                    changed = true;
                }
            } else if tx_in.allow_future_observation
                && !item.unfinalised_attested
                && !item.committed_unfinalised
            {
                let finalise_height = item.block_height + tx_in.confirmation_required.max(1);
                if self
                    .observe_unfinalised(&chain, item, &classification, finalise_height)
                    .await
                {
                    item.unfinalised_attested = true;
                    changed = true;
                }
            }
        }
        changed
    }

    async fn observe_final(
        &self,
        client: &dyn ChainClient,
        chain: &Chain,
        item: &TxInItem,
        classification: &Classification,
    ) -> bool {
        let mut ok = true;
        if let Some(vault) = &classification.outbound {
            if !self.signed_outbound.contains(&item.tx_id) {
                let obs_tx = item.observed_tx(chain, vault.clone(), item.block_height);
                ok &= self.attest(obs_tx, false, false).await;
            }
        }
        if let Some(vault) = &classification.inbound {
            let obs_tx = item.observed_tx(chain, vault.clone(), item.block_height);
            if self.attest(obs_tx, true, false).await {
                client.on_observed_tx_in(item, item.block_height);
            } else {
                ok = false;
            }
        }
        ok
    }

    async fn observe_unfinalised(
        &self,
        chain: &Chain,
        item: &TxInItem,
        classification: &Classification,
        finalise_height: u64,
    ) -> bool {
        let mut ok = true;
        if let Some(vault) = &classification.outbound {
            if !self.signed_outbound.contains(&item.tx_id) {
                let obs_tx = item.observed_tx(chain, vault.clone(), finalise_height);
                ok &= self.attest(obs_tx, false, true).await;
            }
        }
        // Unconfirmed inbounds are only trusted when a vault sent them.
        if let (Some(vault), Some(_)) = (&classification.inbound, &classification.outbound) {
            let obs_tx = item.observed_tx(chain, vault.clone(), finalise_height);
            ok &= self.attest(obs_tx, true, false).await;
        }
        ok
    }

    async fn attest(&self, obs_tx: ObservedTx, inbound: bool, allow_future_observation: bool) -> bool {
        let tx_id = obs_tx.tx.id.clone();
        match self
            .engine
            .attest_observed_tx(obs_tx, inbound, allow_future_observation)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(%tx_id, inbound, "failed to attest observation: {e}");
                false
            }
        }
    }

    fn persist(&self, deck: &OnDeck) {
        let Some(store) = &self.store else {
            return;
        };
        match write_deck(store.as_ref(), deck) {
            Ok(()) => self.metrics.deck_persisted(deck.len()),
            Err(e) => {
                self.metrics.persistence_failed(&e);
                warn!("failed to persist deck: {e}");
            }
        }
    }
}
