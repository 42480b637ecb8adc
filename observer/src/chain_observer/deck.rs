//! Transactions reported by chain clients that are waiting to be attested.

use serde::{Deserialize, Serialize};

use crate::item::{Chain, Coin, ObservedTx, Tx, TxId, VaultPubKey};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInItem {
    pub block_height: u64,
    pub tx_id: TxId,
    pub sender: String,
    pub to: String,
    pub coins: Vec<Coin>,
    pub gas: Vec<Coin>,
    pub memo: String,
    #[serde(default)]
    pub aggregator: Option<String>,
    #[serde(default)]
    pub aggregator_target: Option<String>,
    #[serde(default)]
    pub aggregator_target_limit: Option<u128>,
    /// A final observation of this item has been attested.
    #[serde(default)]
    pub finalised_attested: bool,
    /// A non-final observation of this item has been attested.
    #[serde(default)]
    pub unfinalised_attested: bool,
    /// The consensus chain committed a non-final observation of ours. Nothing more is sent until the item is final.
    #[serde(default)]
    pub committed_unfinalised: bool,
}

impl TxInItem {
    pub fn observed_tx(
        &self,
        chain: &Chain,
        vault: VaultPubKey,
        finalise_height: u64,
    ) -> ObservedTx {
        ObservedTx {
            tx: Tx {
                id: self.tx_id.clone(),
                chain: chain.clone(),
                from_address: self.sender.clone(),
                to_address: self.to.clone(),
                coins: self.coins.clone(),
                gas: self.gas.clone(),
                memo: self.memo.clone(),
            },
            block_height: self.block_height,
            observed_pub_key: vault,
            finalise_height,
            aggregator: self.aggregator.clone(),
            aggregator_target: self.aggregator_target.clone(),
            aggregator_target_limit: self.aggregator_target_limit,
        }
    }
}

/// A batch of transactions reported together by a chain client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub chain: Chain,
    pub mem_pool: bool,
    pub allow_future_observation: bool,
    /// Confirmations the batch needs before it is final.
    pub confirmation_required: u64,
    pub txs: Vec<TxInItem>,
}

impl TxIn {
    fn first_height(&self) -> u64 {
        self.txs.first().map_or(0, |item| item.block_height)
    }

    fn merges_with(&self, other: &TxIn) -> bool {
        self.chain == other.chain
            && self.mem_pool == other.mem_pool
            && self.allow_future_observation == other.allow_future_observation
            && self.first_height() == other.first_height()
    }
}

/// Transactions revoked by a reorg on an external chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrataBlock {
    pub chain: Chain,
    pub height: u64,
    pub txs: Vec<TxId>,
}

/// The queue of reported transactions, grouped by chain, mempool flag, future observation flag and first block height.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDeck {
    entries: Vec<TxIn>,
}

impl OnDeck {
    /// Add a reported batch, merging it into a compatible entry if one exists. Items already on deck are ignored.
    /// Returns whether the deck changed.
    pub fn add(&mut self, tx_in: TxIn) -> bool {
        if tx_in.txs.is_empty() {
            return false;
        }
        let Some(existing) = self.entries.iter_mut().find(|e| e.merges_with(&tx_in)) else {
            self.entries.push(tx_in);
            return true;
        };
        let mut changed = false;
        for item in tx_in.txs {
            let known = existing
                .txs
                .iter()
                .any(|t| t.tx_id == item.tx_id && t.block_height == item.block_height);
            if !known {
                existing.txs.push(item);
                changed = true;
            }
        }
        changed
    }

    pub fn entries(&self) -> &[TxIn] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [TxIn] {
        &mut self.entries
    }

    /// Number of items across every entry.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.txs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every item for `tx_id` on `chain`. Returns the number removed.
    pub fn remove_tx(&mut self, chain: &Chain, tx_id: &TxId) -> usize {
        let mut removed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.chain == *chain) {
            let before = entry.txs.len();
            entry.txs.retain(|item| item.tx_id != *tx_id);
            removed += before - entry.txs.len();
        }
        self.prune();
        removed
    }

    /// Flag every item for `tx_id` on `chain` as committed while not yet final. Returns the number flagged.
    pub fn mark_committed_unfinalised(&mut self, chain: &Chain, tx_id: &TxId) -> usize {
        let mut flagged = 0;
        for entry in self.entries.iter_mut().filter(|e| e.chain == *chain) {
            for item in entry.txs.iter_mut().filter(|item| item.tx_id == *tx_id) {
                item.committed_unfinalised = true;
                flagged += 1;
            }
        }
        flagged
    }

    /// Drop entries with no items left.
    pub fn prune(&mut self) {
        self.entries.retain(|e| !e.txs.is_empty());
    }
}
