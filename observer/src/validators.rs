//! A process-local view of the active validator set.
//!
//! Readers take a cheap snapshot with [ActiveValidators::load] and never block the refresh path, which builds a new
//! [ValidatorSet] and swaps it in.

use std::{collections::HashSet, sync::Arc};

use arc_swap::ArcSwap;
use libp2p::PeerId;
use tracing::*;

use crate::crypto::{NodePublicKey, ValidatorAddress};

#[derive(Debug, Default)]
pub struct ValidatorSet {
    keys: HashSet<NodePublicKey>,
    addresses: HashSet<ValidatorAddress>,
    peers: HashSet<PeerId>,
}

impl ValidatorSet {
    pub fn new(keys: impl IntoIterator<Item = NodePublicKey>) -> Self {
        let mut set = ValidatorSet::default();
        for key in keys {
            match key.to_peer_id() {
                Ok(peer) => {
                    set.peers.insert(peer);
                }
                Err(e) => warn!(%key, "validator key has no peer identity: {e}"),
            }
            set.addresses.insert(key.validator_address());
            set.keys.insert(key);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// Membership test by raw public key, performed on the rendered validator address.
    pub fn contains_key(&self, key: &NodePublicKey) -> bool {
        self.addresses.contains(&key.validator_address())
    }
}

/// Shared handle to the current [ValidatorSet].
#[derive(Debug, Clone, Default)]
pub struct ActiveValidators(Arc<ArcSwap<ValidatorSet>>);

impl ActiveValidators {
    pub fn new(set: ValidatorSet) -> Self {
        ActiveValidators(Arc::new(ArcSwap::from_pointee(set)))
    }

    pub fn load(&self) -> Arc<ValidatorSet> {
        self.0.load_full()
    }

    pub fn store(&self, set: ValidatorSet) {
        let len = set.len();
        let previous = self.0.swap(Arc::new(set));
        if previous.len() != len {
            debug!(previous = previous.len(), current = len, "validator set changed");
        }
    }

    pub fn len(&self) -> usize {
        self.0.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.load().is_empty()
    }

    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.0.load().contains_peer(peer)
    }

    pub fn contains_key(&self, key: &NodePublicKey) -> bool {
        self.0.load().contains_key(key)
    }
}
