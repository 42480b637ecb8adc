//! The four kinds of observation validators attest to, and the attestations themselves.
//!
//! Every kind produces a canonical payload: a kind tag followed by the canonical encoding of every semantically
//! significant field. That payload is the only input to signing and verification, so two items are the same
//! observation exactly when their payloads are byte-equal.

use std::{
    fmt::{self, Display},
    hash::Hash as StdHash,
    str::FromStr,
};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Hash, NodePublicKey, SecretKey},
    error::AttestationError,
    message,
};

/// Symbolic tag identifying an external blockchain, such as `BTC` or `ETH`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Chain(String);

impl Chain {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Chain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 10 {
            return Err(anyhow!("chain identifier must be 1 to 10 characters: {s:?}"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(anyhow!(
                "chain identifier must be upper-case alphanumeric: {s:?}"
            ));
        }
        Ok(Chain(s.to_owned()))
    }
}

impl TryFrom<String> for Chain {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Chain> for String {
    fn from(chain: Chain) -> Self {
        chain.0
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chain-native transaction hash. Equality is byte-exact: no case folding or prefix normalisation is applied.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        TxId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The public key of a vault (the threshold key controlling pooled funds on an external chain).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultPubKey(String);

impl VaultPubKey {
    pub fn new(key: impl Into<String>) -> Self {
        VaultPubKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VaultPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for VaultPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub asset: String,
    pub amount: u128,
}

impl Coin {
    pub fn new(asset: impl Into<String>, amount: u128) -> Self {
        Coin {
            asset: asset.into(),
            amount,
        }
    }
}

/// A transaction on an external chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tx {
    pub id: TxId,
    pub chain: Chain,
    pub from_address: String,
    pub to_address: String,
    pub coins: Vec<Coin>,
    pub gas: Vec<Coin>,
    pub memo: String,
}

/// An external transaction as seen by a validator at a given external height.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservedTx {
    pub tx: Tx,
    pub block_height: u64,
    pub observed_pub_key: VaultPubKey,
    /// The external height at which this observation becomes final.
    pub finalise_height: u64,
    pub aggregator: Option<String>,
    pub aggregator_target: Option<String>,
    pub aggregator_target_limit: Option<u128>,
}

impl ObservedTx {
    pub fn is_final(&self) -> bool {
        self.finalise_height <= self.block_height
    }

    /// A digest of the transaction contents together with the observed height. The same transaction observed at
    /// different heights yields different digests.
    pub fn unique_hash(&self) -> Hash {
        let tx = &self.tx;
        let mut preimages: Vec<Vec<u8>> = vec![
            tx.chain.as_str().as_bytes().to_vec(),
            tx.id.as_str().as_bytes().to_vec(),
            tx.from_address.as_bytes().to_vec(),
            tx.to_address.as_bytes().to_vec(),
            tx.memo.as_bytes().to_vec(),
        ];
        for coin in tx.coins.iter().chain(tx.gas.iter()) {
            preimages.push(coin.asset.as_bytes().to_vec());
            preimages.push(coin.amount.to_be_bytes().to_vec());
        }
        preimages.push(self.block_height.to_be_bytes().to_vec());
        Hash::compute(preimages)
    }
}

/// A report of the fee rate currently paid on an external chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkFee {
    pub chain: Chain,
    pub height: u64,
    pub transaction_size: u64,
    pub transaction_rate: u64,
}

/// An attestation that a vault holds `coins` at an external height.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Solvency {
    pub chain: Chain,
    pub height: u64,
    pub pub_key: VaultPubKey,
    pub coins: Vec<Coin>,
}

impl Solvency {
    pub fn hash(&self) -> Hash {
        let mut preimages: Vec<Vec<u8>> = vec![
            self.chain.as_str().as_bytes().to_vec(),
            self.height.to_be_bytes().to_vec(),
            self.pub_key.as_str().as_bytes().to_vec(),
        ];
        for coin in &self.coins {
            preimages.push(coin.asset.as_bytes().to_vec());
            preimages.push(coin.amount.to_be_bytes().to_vec());
        }
        Hash::compute(preimages)
    }
}

/// An assertion that a previously reported transaction is invalid and must be revoked.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrataTx {
    pub chain: Chain,
    pub id: TxId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    ObservedTx,
    NetworkFee,
    Solvency,
    ErrataTx,
}

impl ItemKind {
    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::ObservedTx => "observed_tx",
            ItemKind::NetworkFee => "network_fee",
            ItemKind::Solvency => "solvency",
            ItemKind::ErrataTx => "errata_tx",
        }
    }

    fn tag(&self) -> &'static [u8] {
        match self {
            ItemKind::ObservedTx => b"observed-tx\0",
            ItemKind::NetworkFee => b"network-fee\0",
            ItemKind::Solvency => b"solvency\0",
            ItemKind::ErrataTx => b"errata-tx\0",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    /// Direction of an observed transaction.
    Inbound,
    /// Whether the observation may be admitted before it is final.
    AllowFutureObservation,
}

/// Per-item flags that travel alongside an item but are not part of its canonical payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    inbound: Option<bool>,
    allow_future_observation: Option<bool>,
}

impl Metadata {
    pub fn observed_tx(inbound: bool, allow_future_observation: bool) -> Self {
        Metadata {
            inbound: Some(inbound),
            allow_future_observation: Some(allow_future_observation),
        }
    }

    pub fn set(&mut self, key: MetadataKey, value: bool) {
        match key {
            MetadataKey::Inbound => self.inbound = Some(value),
            MetadataKey::AllowFutureObservation => self.allow_future_observation = Some(value),
        }
    }

    pub fn get(&self, key: MetadataKey) -> Option<bool> {
        match key {
            MetadataKey::Inbound => self.inbound,
            MetadataKey::AllowFutureObservation => self.allow_future_observation,
        }
    }

    pub fn inbound(&self) -> bool {
        self.inbound.unwrap_or(false)
    }

    pub fn allow_future_observation(&self) -> bool {
        self.allow_future_observation.unwrap_or(false)
    }
}

/// The map key for observed transactions. A transaction between two of our vaults is observed once in each direction,
/// and each direction gathers its own attestations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObservedTxKey {
    pub chain: Chain,
    pub id: TxId,
    pub unique_hash: Hash,
    pub observed_pub_key: VaultPubKey,
    pub inbound: bool,
    pub allow_future_observation: bool,
    pub is_final: bool,
}

/// An item validators sign and gather signatures for.
pub trait SignableItem:
    Clone + fmt::Debug + PartialEq + Serialize + Send + Sync + 'static
{
    /// Collapses semantically equal items into one attestation state.
    type Fingerprint: Clone + Eq + StdHash + fmt::Debug + Send + Sync + 'static;

    const KIND: ItemKind;

    /// The single accepted byte form of this item.
    fn canonical_payload(&self) -> Result<Vec<u8>> {
        let mut payload = Self::KIND.tag().to_vec();
        payload.extend(message::encode(self)?);
        Ok(payload)
    }

    fn fingerprint(&self, metadata: &Metadata) -> Self::Fingerprint;
}

impl SignableItem for ObservedTx {
    type Fingerprint = ObservedTxKey;

    const KIND: ItemKind = ItemKind::ObservedTx;

    fn fingerprint(&self, metadata: &Metadata) -> ObservedTxKey {
        ObservedTxKey {
            chain: self.tx.chain.clone(),
            id: self.tx.id.clone(),
            unique_hash: self.unique_hash(),
            observed_pub_key: self.observed_pub_key.clone(),
            inbound: metadata.inbound(),
            allow_future_observation: metadata.allow_future_observation(),
            is_final: self.is_final(),
        }
    }
}

impl SignableItem for NetworkFee {
    type Fingerprint = NetworkFee;

    const KIND: ItemKind = ItemKind::NetworkFee;

    fn fingerprint(&self, _: &Metadata) -> NetworkFee {
        self.clone()
    }
}

impl SignableItem for Solvency {
    type Fingerprint = Hash;

    const KIND: ItemKind = ItemKind::Solvency;

    fn fingerprint(&self, _: &Metadata) -> Hash {
        self.hash()
    }
}

impl SignableItem for ErrataTx {
    type Fingerprint = ErrataTx;

    const KIND: ItemKind = ItemKind::ErrataTx;

    fn fingerprint(&self, _: &Metadata) -> ErrataTx {
        self.clone()
    }
}

/// A signer's signature over the canonical payload of an item.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub pub_key: NodePublicKey,
    pub signature: Vec<u8>,
}

impl Attestation {
    pub fn sign<T: SignableItem>(item: &T, key: &SecretKey) -> Result<Attestation> {
        let payload = item.canonical_payload()?;
        Ok(Attestation {
            pub_key: key.node_public_key(),
            signature: key.sign(&payload),
        })
    }

    pub fn verify<T: SignableItem>(&self, item: &T) -> Result<()> {
        let payload = item.canonical_payload()?;
        self.pub_key
            .verify(&payload, &self.signature)
            .map_err(|_| AttestationError::SignatureMismatch.into())
    }
}

impl fmt::Debug for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attestation")
            .field("pub_key", &self.pub_key)
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}
