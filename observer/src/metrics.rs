use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use opentelemetry_semantic_conventions::attribute::ERROR_TYPE;

use crate::error::error_label;

/// Instruments shared by the attestation pipeline. Without a configured meter provider these are no-ops.
#[derive(Clone, Debug)]
pub struct Metrics {
    attestations_received: Counter<u64>,
    attestations_rejected: Counter<u64>,
    quorum_submissions: Counter<u64>,
    consensus_rpc_failures: Counter<u64>,
    peer_send_failures: Counter<u64>,
    persistence_failures: Counter<u64>,
    flush_duration: Histogram<f64>,
    deck_size: Histogram<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_meter(&global::meter("observer"))
    }

    pub fn with_meter(meter: &Meter) -> Self {
        Metrics {
            attestations_received: meter
                .u64_counter("observer.attestations.received")
                .with_description("Attestations newly recorded, local or remote")
                .build(),
            attestations_rejected: meter
                .u64_counter("observer.attestations.rejected")
                .build(),
            quorum_submissions: meter.u64_counter("observer.quorum.submissions").build(),
            consensus_rpc_failures: meter
                .u64_counter("observer.consensus_rpc.failures")
                .build(),
            peer_send_failures: meter.u64_counter("observer.peer.send.failures").build(),
            persistence_failures: meter
                .u64_counter("observer.persistence.failures")
                .build(),
            flush_duration: meter
                .f64_histogram("observer.broadcast.flush.duration")
                .with_description("Time from taking a batch until every peer send has finished")
                .with_unit("s")
                .with_boundaries(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0])
                .build(),
            deck_size: meter.u64_histogram("observer.deck.size").build(),
        }
    }

    pub fn received(&self, kind: &'static str) {
        self.attestations_received
            .add(1, &[KeyValue::new("kind", kind)]);
    }

    pub fn rejected(&self, e: &anyhow::Error) {
        self.attestations_rejected
            .add(1, &[KeyValue::new(ERROR_TYPE, error_label(e))]);
    }

    pub fn quorum_submitted(&self, kind: &'static str, is_quorum: bool) {
        self.quorum_submissions.add(
            1,
            &[KeyValue::new("kind", kind), KeyValue::new("quorum", is_quorum)],
        );
    }

    pub fn consensus_rpc_failed(&self) {
        self.consensus_rpc_failures.add(1, &[]);
    }

    pub fn peer_send_failed(&self, e: &anyhow::Error) {
        self.peer_send_failures
            .add(1, &[KeyValue::new(ERROR_TYPE, error_label(e))]);
    }

    pub fn persistence_failed(&self, e: &anyhow::Error) {
        self.persistence_failures
            .add(1, &[KeyValue::new(ERROR_TYPE, error_label(e))]);
    }

    pub fn flush_took(&self, seconds: f64) {
        self.flush_duration.record(seconds, &[]);
    }

    pub fn deck_persisted(&self, items: usize) {
        self.deck_size.record(items as u64, &[]);
    }
}
