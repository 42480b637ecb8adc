//! Messages exchanged between validators and submitted to the consensus chain, plus the canonical codec used for
//! both wire frames and signable payloads.

use anyhow::Result;
use bincode::config::Config;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::AttestationError,
    item::{Attestation, ErrataTx, NetworkFee, ObservedTx, Solvency},
};

/// Upper bound on the size of any single decoded value.
pub const MAX_DECODE_BYTES: usize = 32 * 1024 * 1024;

fn codec_config() -> impl Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_DECODE_BYTES>()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, codec_config())?)
}

/// Decode exactly one value from `bytes`. Trailing bytes are rejected, so there is only one accepted encoding of any
/// value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, codec_config())
        .map_err(|e| AttestationError::InvalidEncoding(e.to_string()))?;
    if read != bytes.len() {
        return Err(AttestationError::InvalidEncoding(format!(
            "{} trailing bytes",
            bytes.len() - read
        ))
        .into());
    }
    Ok(value)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestTx {
    pub obs_tx: ObservedTx,
    pub inbound: bool,
    pub allow_future_observation: bool,
    pub attestation: Attestation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestNetworkFee {
    pub network_fee: NetworkFee,
    pub attestation: Attestation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestSolvency {
    pub solvency: Solvency,
    pub attestation: Attestation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestErrataTx {
    pub errata_tx: ErrataTx,
    pub attestation: Attestation,
}

/// Attestations of every kind, gathered over one batch interval and sent to peers in a single frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationBatch {
    pub attest_txs: Vec<AttestTx>,
    pub attest_network_fees: Vec<AttestNetworkFee>,
    pub attest_solvencies: Vec<AttestSolvency>,
    pub attest_errata_txs: Vec<AttestErrataTx>,
}

impl AttestationBatch {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.attest_txs.len()
            + self.attest_network_fees.len()
            + self.attest_solvencies.len()
            + self.attest_errata_txs.len()
    }

    /// Rejects batches in which any kind exceeds `max_batch_size` items.
    pub fn check_limits(&self, max_batch_size: usize) -> Result<()> {
        let sizes = [
            ("observed_tx", self.attest_txs.len()),
            ("network_fee", self.attest_network_fees.len()),
            ("solvency", self.attest_solvencies.len()),
            ("errata_tx", self.attest_errata_txs.len()),
        ];
        for (kind, size) in sizes {
            if size > max_batch_size {
                return Err(AttestationError::InvalidEncoding(format!(
                    "batch carries {size} {kind} attestations, limit is {max_batch_size}"
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumTx {
    pub obs_tx: ObservedTx,
    pub inbound: bool,
    pub allow_future_observation: bool,
    pub attestations: Vec<Attestation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumNetworkFee {
    pub network_fee: NetworkFee,
    pub attestations: Vec<Attestation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSolvency {
    pub solvency: Solvency,
    pub attestations: Vec<Attestation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumErrataTx {
    pub errata_tx: ErrataTx,
    pub attestations: Vec<Attestation>,
}

/// A package of attestations for one item, submitted to the consensus chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumMessage {
    Tx(QuorumTx),
    NetworkFee(QuorumNetworkFee),
    Solvency(QuorumSolvency),
    ErrataTx(QuorumErrataTx),
}

impl QuorumMessage {
    pub fn attestations(&self) -> &[Attestation] {
        match self {
            QuorumMessage::Tx(q) => &q.attestations,
            QuorumMessage::NetworkFee(q) => &q.attestations,
            QuorumMessage::Solvency(q) => &q.attestations,
            QuorumMessage::ErrataTx(q) => &q.attestations,
        }
    }
}

/// One data frame of a state-sync transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumStateBatch {
    pub quorum_txs: Vec<QuorumTx>,
    pub quorum_network_fees: Vec<QuorumNetworkFee>,
    pub quorum_solvencies: Vec<QuorumSolvency>,
    pub quorum_errata_txs: Vec<QuorumErrataTx>,
}

impl QuorumStateBatch {
    pub fn len(&self) -> usize {
        self.quorum_txs.len()
            + self.quorum_network_fees.len()
            + self.quorum_solvencies.len()
            + self.quorum_errata_txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, message: QuorumMessage) {
        match message {
            QuorumMessage::Tx(q) => self.quorum_txs.push(q),
            QuorumMessage::NetworkFee(q) => self.quorum_network_fees.push(q),
            QuorumMessage::Solvency(q) => self.quorum_solvencies.push(q),
            QuorumMessage::ErrataTx(q) => self.quorum_errata_txs.push(q),
        }
    }

    pub fn into_messages(self) -> impl Iterator<Item = QuorumMessage> {
        self.quorum_txs
            .into_iter()
            .map(QuorumMessage::Tx)
            .chain(self.quorum_network_fees.into_iter().map(QuorumMessage::NetworkFee))
            .chain(self.quorum_solvencies.into_iter().map(QuorumMessage::Solvency))
            .chain(self.quorum_errata_txs.into_iter().map(QuorumMessage::ErrataTx))
    }
}

/// Opens a state-sync transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSyncBegin {
    pub batches: u32,
}

/// Announces the next data frame of a state-sync transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSyncHeader {
    pub index: u32,
    pub items: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::SecretKey, item::tests::observed_tx};

    fn attest_tx(id: &str) -> AttestTx {
        let key = SecretKey::from_hex(&"55".repeat(32)).unwrap();
        let obs_tx = observed_tx(id, 3);
        let attestation = Attestation::sign(&obs_tx, &key).unwrap();
        AttestTx {
            obs_tx,
            inbound: true,
            allow_future_observation: false,
            attestation,
        }
    }

    #[test]
    fn batch_preserves_order() {
        let batch = AttestationBatch {
            attest_txs: vec![attest_tx("b"), attest_tx("a"), attest_tx("c")],
            ..Default::default()
        };
        let decoded: AttestationBatch = decode(&encode(&batch).unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&attest_tx("a")).unwrap();
        bytes.push(0);
        let err = decode::<AttestTx>(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AttestationError>(),
            Some(AttestationError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = encode(&attest_tx("a")).unwrap();
        assert!(decode::<AttestTx>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn oversized_kinds_fail_the_limit_check() {
        let batch = AttestationBatch {
            attest_txs: vec![attest_tx("a"), attest_tx("b")],
            ..Default::default()
        };
        batch.check_limits(2).unwrap();
        assert!(batch.check_limits(1).is_err());
    }
}
