//! Operation metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless a
//! recorder (the Prometheus exporter in the binary) is installed.

use nodekeeper_core::OperationState;

pub const SUBMITTED_TOTAL: &str = "nodekeeper_operations_submitted_total";
pub const FINISHED_TOTAL: &str = "nodekeeper_operations_finished_total";
pub const EVICTED_TOTAL: &str = "nodekeeper_operations_evicted_total";
pub const RUNNING: &str = "nodekeeper_operations_running";
pub const PENDING: &str = "nodekeeper_operations_pending";

/// Registers descriptions so exporters show help text before the first sample.
pub fn describe() {
    metrics::describe_counter!(SUBMITTED_TOTAL, "Operations accepted, by type");
    metrics::describe_counter!(
        FINISHED_TOTAL,
        "Operations that reached a terminal state, by type and state"
    );
    metrics::describe_counter!(EVICTED_TOTAL, "Terminal operations removed after retention");
    metrics::describe_gauge!(RUNNING, "Operations currently executing");
    metrics::describe_gauge!(PENDING, "Operations waiting for a worker or exclusion group");
}

pub(crate) fn record_submitted(type_name: &'static str) {
    metrics::counter!(SUBMITTED_TOTAL, "type" => type_name).increment(1);
}

pub(crate) fn record_finished(type_name: &'static str, state: OperationState) {
    metrics::counter!(FINISHED_TOTAL, "type" => type_name, "state" => state.as_str()).increment(1);
}

pub(crate) fn record_evicted(count: usize) {
    metrics::counter!(EVICTED_TOTAL).increment(count as u64);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn set_queue_depth(running: usize, pending: usize) {
    metrics::gauge!(RUNNING).set(running as f64);
    metrics::gauge!(PENDING).set(pending as f64);
}
