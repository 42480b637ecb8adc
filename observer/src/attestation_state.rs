use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::{
    error::AttestationError,
    item::{Attestation, Metadata, MetadataKey, SignableItem},
    time::SystemTime,
};

#[derive(Clone, Debug)]
struct AttestationSent {
    attestation: Attestation,
    sent: bool,
}

/// Everything one validator knows about a single item: the attestations collected so far, which of them have been
/// submitted to the consensus chain, and when.
#[derive(Debug)]
pub struct AttestationState<T> {
    item: T,
    attestations: Vec<AttestationSent>,
    first_observed: SystemTime,
    initial_attestations_sent: Option<SystemTime>,
    quorum_attestations_sent: Option<SystemTime>,
    last_attestations_sent: Option<SystemTime>,
    metadata: Metadata,
}

/// Point-in-time summary of an [AttestationState], exposed by the status API.
#[derive(Clone, Debug, Serialize)]
pub struct AttestationStateSummary {
    pub item: serde_json::Value,
    pub attestations: usize,
    pub unsent: usize,
    pub first_observed: u64,
    pub initial_attestations_sent: Option<u64>,
    pub quorum_attestations_sent: Option<u64>,
    pub last_attestations_sent: Option<u64>,
    pub metadata: Metadata,
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn elapsed_since(time: SystemTime) -> Duration {
    // A clock that went backwards counts as no time having passed.
    time.elapsed().unwrap_or_default()
}

impl<T: SignableItem> AttestationState<T> {
    pub fn new(item: T, metadata: Metadata) -> Self {
        AttestationState {
            item,
            attestations: Vec::new(),
            first_observed: SystemTime::now(),
            initial_attestations_sent: None,
            quorum_attestations_sent: None,
            last_attestations_sent: None,
            metadata,
        }
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    /// Record an attestation. Re-adding an identical signature is a no-op. A different signature from a signer we
    /// already hold is rejected with [AttestationError::DuplicateSignerDifferentSignature], and a signature that
    /// does not verify against the item with [AttestationError::SignatureMismatch]. Returns whether the attestation
    /// was new.
    pub fn add_attestation(&mut self, attestation: Attestation) -> Result<bool> {
        if self
            .attestations
            .iter()
            .any(|a| a.attestation.signature == attestation.signature)
        {
            return Ok(false);
        }
        if self
            .attestations
            .iter()
            .any(|a| a.attestation.pub_key == attestation.pub_key)
        {
            return Err(
                AttestationError::DuplicateSignerDifferentSignature(attestation.pub_key).into(),
            );
        }
        attestation.verify(&self.item)?;
        self.attestations.push(AttestationSent {
            attestation,
            sent: false,
        });
        Ok(true)
    }

    pub fn attestations(&self) -> impl Iterator<Item = &Attestation> {
        self.attestations.iter().map(|a| &a.attestation)
    }

    pub fn unsent_attestations(&self) -> Vec<Attestation> {
        self.attestations
            .iter()
            .filter(|a| !a.sent)
            .map(|a| a.attestation.clone())
            .collect()
    }

    pub fn attestation_count(&self) -> usize {
        self.attestations.len()
    }

    pub fn unsent_count(&self) -> usize {
        self.attestations.iter().filter(|a| !a.sent).count()
    }

    pub fn quorum_attestations_sent(&self) -> Option<SystemTime> {
        self.quorum_attestations_sent
    }

    /// Whether unsent attestations have waited long enough to be submitted on their own.
    pub fn should_send_late(&self, min_gap: Duration) -> bool {
        if self.unsent_count() == 0 {
            return false;
        }
        match self.last_attestations_sent {
            Some(last) => elapsed_since(last) > min_gap,
            None => elapsed_since(self.first_observed) > min_gap,
        }
    }

    /// Whether this state can be dropped. Items that never reached quorum only expire once they have been sent and
    /// then left alone for `non_quorum_timeout`.
    pub fn expired_after_quorum(
        &self,
        late_observe_timeout: Duration,
        non_quorum_timeout: Duration,
    ) -> bool {
        if let Some(last) = self.last_attestations_sent {
            if elapsed_since(last) > non_quorum_timeout {
                return true;
            }
        }
        if let Some(quorum) = self.quorum_attestations_sent {
            if elapsed_since(quorum) > late_observe_timeout {
                return true;
            }
        }
        false
    }

    pub fn mark_attestations_sent(&mut self, is_quorum: bool) {
        let now = SystemTime::now();
        self.last_attestations_sent = Some(now);
        if self.initial_attestations_sent.is_none() {
            self.initial_attestations_sent = Some(now);
        }
        if is_quorum && self.quorum_attestations_sent.is_none() {
            self.quorum_attestations_sent = Some(now);
        }
        for a in self.attestations.iter_mut() {
            a.sent = true;
        }
    }

    pub fn set_metadata(&mut self, key: MetadataKey, value: bool) {
        self.metadata.set(key, value);
    }

    pub fn get_metadata(&self, key: MetadataKey) -> Option<bool> {
        self.metadata.get(key)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn state_summary(&self) -> AttestationStateSummary {
        AttestationStateSummary {
            item: serde_json::to_value(&self.item).unwrap_or(serde_json::Value::Null),
            attestations: self.attestation_count(),
            unsent: self.unsent_count(),
            first_observed: unix_secs(self.first_observed),
            initial_attestations_sent: self.initial_attestations_sent.map(unix_secs),
            quorum_attestations_sent: self.quorum_attestations_sent.map(unix_secs),
            last_attestations_sent: self.last_attestations_sent.map(unix_secs),
            metadata: self.metadata,
        }
    }
}
