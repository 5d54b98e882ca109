//! Prometheus metrics for the metadata store.
//!
//! This module provides metrics for monitoring metadata backends:
//! - Operation counts by backend, operation and outcome
//! - Operation latency
//! - State transitions and compare-and-swap conflicts
//! - Per-state message gauges

mod helpers;

pub use helpers::{encode_metrics, MetaStoreMetrics, OperationTimer};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "metastore";

lazy_static! {
    // ============================================================================
    // Operation Metrics
    // ============================================================================

    /// Backend operations by outcome (`ok` or an error kind)
    pub static ref OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_operations_total", METRIC_PREFIX),
        "Total metadata backend operations",
        &["backend", "operation", "outcome"]
    ).unwrap();

    /// Backend operation latency
    pub static ref OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_operation_latency_seconds", METRIC_PREFIX),
        "Metadata backend operation latency in seconds",
        &["backend", "operation"],
        vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    // ============================================================================
    // State Metrics
    // ============================================================================

    /// Successful state transitions
    pub static ref STATE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_state_transitions_total", METRIC_PREFIX),
        "Total successful state transitions",
        &["backend", "from", "to"]
    ).unwrap();

    /// Compare-and-swap attempts that lost a race
    pub static ref STATE_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_state_conflicts_total", METRIC_PREFIX),
        "Total state transitions rejected because the message had already moved",
        &["backend"]
    ).unwrap();

    /// Messages currently in each state
    pub static ref STATE_MESSAGES: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_state_messages", METRIC_PREFIX),
        "Number of messages per queue state",
        &["backend", "state"]
    ).unwrap();
}
