//! Metrics helper structs for convenient metric recording

use std::time::Instant;

use prometheus::{Encoder, TextEncoder};

use crate::metastore::{MetaStoreError, QueueState};

use super::{
    OPERATIONS_TOTAL, OPERATION_LATENCY, STATE_CONFLICTS_TOTAL, STATE_MESSAGES,
    STATE_TRANSITIONS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording metadata backend metrics
pub struct MetaStoreMetrics;

impl MetaStoreMetrics {
    /// Record the outcome of one backend operation
    pub fn record_operation<T>(
        backend: &str,
        operation: &str,
        result: &Result<T, MetaStoreError>,
    ) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        OPERATIONS_TOTAL
            .with_label_values(&[backend, operation, outcome])
            .inc();

        if let Err(MetaStoreError::StateConflict { .. }) = result {
            STATE_CONFLICTS_TOTAL.with_label_values(&[backend]).inc();
        }
    }

    /// Record a successful state transition
    pub fn record_transition(backend: &str, from: QueueState, to: QueueState) {
        STATE_TRANSITIONS_TOTAL
            .with_label_values(&[backend, from.as_str(), to.as_str()])
            .inc();
    }

    /// Publish the current per-state counts
    pub fn set_state_count(backend: &str, state: QueueState, count: i64) {
        STATE_MESSAGES
            .with_label_values(&[backend, state.as_str()])
            .set(count);
    }
}

/// Measures one backend operation and records it when finished.
pub struct OperationTimer {
    backend: &'static str,
    operation: &'static str,
    started: Instant,
}

impl OperationTimer {
    pub fn start(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            started: Instant::now(),
        }
    }

    /// Record latency and outcome, passing the result through.
    pub fn finish<T>(self, result: Result<T, MetaStoreError>) -> Result<T, MetaStoreError> {
        OPERATION_LATENCY
            .with_label_values(&[self.backend, self.operation])
            .observe(self.started.elapsed().as_secs_f64());
        MetaStoreMetrics::record_operation(self.backend, self.operation, &result);
        result
    }
}
