use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::item::TxId;

/// Outbound transactions this node signed itself. Observing one of these again would only repeat our own signature.
pub struct SignedOutboundCache {
    cache: Mutex<LruCache<TxId, ()>>,
}

impl SignedOutboundCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        SignedOutboundCache {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, tx_id: TxId) {
        self.cache.lock().put(tx_id, ());
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.cache.lock().contains(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_are_evicted() {
        let cache = SignedOutboundCache::new(2);
        cache.insert(TxId::new("a"));
        cache.insert(TxId::new("b"));
        cache.insert(TxId::new("c"));
        assert!(!cache.contains(&TxId::new("a")));
        assert!(cache.contains(&TxId::new("b")));
        assert!(cache.contains(&TxId::new("c")));
    }
}
