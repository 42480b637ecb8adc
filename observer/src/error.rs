use thiserror::Error;

use crate::crypto::NodePublicKey;

/// The classes of failure the attestation pipeline distinguishes. Most functions return [anyhow::Result]; callers that
/// need to react to a particular class use `downcast_ref::<AttestationError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("signature does not verify")]
    SignatureMismatch,
    #[error("{0} is not an active validator")]
    NotActive(String),
    #[error("{0} already attested with a different signature")]
    DuplicateSignerDifferentSignature(NodePublicKey),
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),
    #[error("consensus RPC failed: {0}")]
    ConsensusRpcFailure(String),
    #[error("protocol not supported by peer")]
    ProtocolNotSupported,
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl AttestationError {
    /// A short, stable label used as the `error.type` metric attribute.
    pub fn label(&self) -> &'static str {
        match self {
            AttestationError::InvalidEncoding(_) => "invalid-encoding",
            AttestationError::SignatureMismatch => "signature-mismatch",
            AttestationError::NotActive(_) => "not-active",
            AttestationError::DuplicateSignerDifferentSignature(_) => "duplicate-signer",
            AttestationError::PeerUnavailable(_) => "peer-unavailable",
            AttestationError::ConsensusRpcFailure(_) => "consensus-rpc",
            AttestationError::ProtocolNotSupported => "protocol-not-supported",
            AttestationError::PersistenceFailure(_) => "persistence",
        }
    }
}

/// Label for an arbitrary error, falling back to `"other"` when it is not an [AttestationError].
pub fn error_label(e: &anyhow::Error) -> &'static str {
    e.downcast_ref::<AttestationError>()
        .map(AttestationError::label)
        .unwrap_or("other")
}
