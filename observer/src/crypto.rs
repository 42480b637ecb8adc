//! A collection of cryptographic primitives used by the observer.
//!
//! The exact implementations of these primitives is an implementation detail for this module only and dependents
//! should not care about the implementations. Validator keys are secp256k1; the libp2p identity of a validator is
//! derived from the same secret, so a peer id can always be mapped back to a validator public key.

use std::fmt::{self, Display};

use anyhow::{Result, anyhow};
use bech32::{Bech32, Hrp};
use k256::ecdsa::{
    Signature as EcdsaSignature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use libp2p::PeerId;
use serde::{
    Deserialize, Serialize,
    de::{self, Unexpected},
};
use sha3::{Digest, Keccak256};

/// Human readable part of a rendered validator address.
const VALIDATOR_ADDRESS_HRP: &str = "val";

/// The public key of a validator, stored in its 33-byte compressed SEC1 form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePublicKey([u8; 33]);

impl NodePublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<NodePublicKey> {
        let key = VerifyingKey::from_sec1_bytes(bytes)?;
        let compressed = key.to_encoded_point(true);
        let bytes: [u8; 33] = compressed.as_bytes().try_into()?;
        Ok(NodePublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(VerifyingKey::from_sec1_bytes(&self.0)?)
    }

    /// Verify an ECDSA signature over `message`. The signature must be the 64-byte fixed encoding with a
    /// normalised `s`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = EcdsaSignature::from_slice(signature).map_err(|e| anyhow!(e))?;
        self.verifying_key()?
            .verify(message, &signature)
            .map_err(|_| anyhow!("invalid signature"))
    }

    /// The libp2p peer id of the node owning this key.
    pub fn to_peer_id(&self) -> Result<PeerId> {
        let key = libp2p::identity::secp256k1::PublicKey::try_from_bytes(&self.0)?;
        let key: libp2p::identity::PublicKey = key.into();
        Ok(key.to_peer_id())
    }

    /// Render this key to the canonical validator address form.
    pub fn validator_address(&self) -> ValidatorAddress {
        // Use the uncompressed point without its tag byte, the same preimage Ethereum style addresses use.
        let uncompressed = self
            .verifying_key()
            .map(|k| k.to_encoded_point(false).as_bytes()[1..].to_vec())
            .unwrap_or_else(|_| self.0.to_vec());
        let digest = Keccak256::digest(uncompressed);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..32]);
        ValidatorAddress(bytes)
    }
}

impl Display for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodePublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.to_vec().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodePublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        NodePublicKey::from_bytes(&bytes)
            .map_err(|_| de::Error::invalid_value(Unexpected::Bytes(&bytes), &"a public key"))
    }
}

/// The address form of a validator. Only used to test membership of the active validator set; it never crosses the
/// wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatorAddress([u8; 20]);

impl ValidatorAddress {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for ValidatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hrp = Hrp::parse_unchecked(VALIDATOR_ADDRESS_HRP);
        match bech32::encode::<Bech32>(hrp, &self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}", hex::encode(self.0)),
        }
    }
}

impl fmt::Debug for ValidatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// The secret key type used as the basis of all cryptography in the node.
/// Both the `NodePublicKey` and the libp2p identity are derived from this.
#[derive(Clone, Copy)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

impl SecretKey {
    /// Generates a random private key.
    pub fn new() -> Result<SecretKey> {
        Self::new_from_rng(&mut rand::rngs::OsRng)
    }

    pub fn new_from_rng<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Result<SecretKey> {
        let key = SigningKey::random(rng);
        Self::from_bytes(&key.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }
        // Rejects scalars outside the curve order.
        SigningKey::from_bytes(&bytes.into())?;

        Ok(SecretKey { bytes })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s)?;
        Self::from_bytes(&bytes_vec)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    fn as_ecdsa(&self) -> SigningKey {
        // `from_bytes` was checked on construction.
        SigningKey::from_bytes(&self.bytes.into()).expect("secret key validated on construction")
    }

    /// Signs `message` (hashed with SHA-256). Signatures are deterministic (RFC 6979), so signing the same payload
    /// twice yields byte-identical output.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: EcdsaSignature = self.as_ecdsa().sign(message);
        signature.to_bytes().to_vec()
    }

    pub fn node_public_key(&self) -> NodePublicKey {
        let point = VerifyingKey::from(&self.as_ecdsa()).to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.as_bytes());
        NodePublicKey(bytes)
    }

    pub fn to_libp2p_keypair(&self) -> libp2p::identity::Keypair {
        let secret = libp2p::identity::secp256k1::SecretKey::try_from_bytes(self.bytes)
            .expect("`SecretKey::from_bytes` only accepts valid secp256k1 scalars");
        libp2p::identity::secp256k1::Keypair::from(secret).into()
    }

    pub fn peer_id(&self) -> PeerId {
        self.to_libp2p_keypair().public().to_peer_id()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn sign_and_verify() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let key = SecretKey::new_from_rng(&mut rng).unwrap();
        let public = key.node_public_key();

        let signature = key.sign(b"payload");
        public.verify(b"payload", &signature).unwrap();
        assert!(public.verify(b"other payload", &signature).is_err());
        assert!(public.verify(b"payload", &signature[1..]).is_err());
    }

    #[test]
    fn signatures_are_deterministic() {
        let key = SecretKey::from_hex(&"11".repeat(32)).unwrap();
        assert_eq!(key.sign(b"abc"), key.sign(b"abc"));
    }

    #[test]
    fn peer_id_derives_from_public_key() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let key = SecretKey::new_from_rng(&mut rng).unwrap();
        assert_eq!(key.node_public_key().to_peer_id().unwrap(), key.peer_id());
    }

    #[test]
    fn public_key_round_trips_through_serde() {
        let key = SecretKey::from_hex(&"22".repeat(32)).unwrap().node_public_key();
        let json = serde_json::to_string(&key).unwrap();
        let decoded: NodePublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, decoded);
        assert!(serde_json::from_str::<NodePublicKey>("[1,2,3]").is_err());
    }

    #[test]
    fn validator_address_renders_bech32() {
        let key = SecretKey::from_hex(&"33".repeat(32)).unwrap().node_public_key();
        let address = key.validator_address().to_string();
        assert!(address.starts_with("val1"));
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert!(SecretKey::from_bytes(&[0; 32]).is_err());
        assert!(SecretKey::from_bytes(&[1; 31]).is_err());
    }
}
