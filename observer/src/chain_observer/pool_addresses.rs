use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use tracing::*;

use crate::{
    bridge::ConsensusBridge,
    item::{Chain, VaultPubKey},
};

type AddressBook = HashMap<(Chain, String), VaultPubKey>;

/// Which direction a transaction moves funds relative to our vaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// Set when the recipient is a vault address.
    pub inbound: Option<VaultPubKey>,
    /// Set when the sender is a vault address.
    pub outbound: Option<VaultPubKey>,
}

/// The known vault addresses on every external chain, as last reported by the consensus chain.
pub struct PoolAddresses {
    bridge: Arc<dyn ConsensusBridge>,
    addresses: ArcSwap<AddressBook>,
}

impl PoolAddresses {
    pub fn new(bridge: Arc<dyn ConsensusBridge>) -> Self {
        PoolAddresses {
            bridge,
            addresses: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Reload the vault addresses. On failure the previous addresses stay in use.
    pub async fn refresh(&self) {
        match self.bridge.vault_addresses().await {
            Ok(addresses) => {
                let book: AddressBook = addresses
                    .into_iter()
                    .map(|a| ((a.chain, a.address), a.pub_key))
                    .collect();
                trace!(addresses = book.len(), "refreshed vault addresses");
                self.addresses.store(Arc::new(book));
            }
            Err(e) => warn!("failed to refresh vault addresses: {e}"),
        }
    }

    pub fn vault_of(&self, chain: &Chain, address: &str) -> Option<VaultPubKey> {
        self.addresses
            .load()
            .get(&(chain.clone(), address.to_owned()))
            .cloned()
    }

    pub fn classify(&self, chain: &Chain, sender: &str, recipient: &str) -> Classification {
        Classification {
            inbound: self.vault_of(chain, recipient),
            outbound: self.vault_of(chain, sender),
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
