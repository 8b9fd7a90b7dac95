//! Allocator metrics.
//!
//! Gauges and counters are published through the `metrics` facade. The same
//! numbers are also served by the allocator actor as a [`MetricsSnapshot`],
//! so callers without a recorder installed can still read them.

use std::collections::BTreeMap;

use corral_resources::Resources;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use serde::Serialize;

pub mod metric_definitions {
    /// Messages waiting in the allocator mailbox.
    pub const EVENT_QUEUE_DISPATCHES: &str = "allocator/event_queue_dispatches";

    /// Completed allocation passes.
    pub const ALLOCATION_RUNS: &str = "allocator/allocation_runs";

    /// Prefix of the per-resource total gauges.
    pub const TOTAL_PREFIX: &str = "allocator/total";

    /// Prefix of the per-resource allocated gauges.
    pub const ALLOCATED_PREFIX: &str = "allocator/allocated";
}

use metric_definitions::*;

/// Registers metric descriptions. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_gauge!(
        EVENT_QUEUE_DISPATCHES,
        "Number of messages waiting in the allocator mailbox"
    );
    describe_counter!(ALLOCATION_RUNS, "Number of completed allocation passes");
}

/// Point-in-time view of the allocator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub event_queue_dispatches: usize,
    pub allocation_runs: u64,
    /// Scalar totals of all agents, by resource name.
    pub total: BTreeMap<String, f64>,
    /// Scalar resources currently allocated, by resource name.
    pub allocated: BTreeMap<String, f64>,
}

pub(crate) fn scalar_map(resources: &Resources) -> BTreeMap<String, f64> {
    resources
        .names()
        .into_iter()
        .filter_map(|name| resources.get_scalar(&name).map(|value| (name, value)))
        .collect()
}

pub(crate) fn record_queue_depth(depth: usize) {
    gauge!(EVENT_QUEUE_DISPATCHES).set(depth as f64);
}

pub(crate) fn record_allocation_run() {
    counter!(ALLOCATION_RUNS).increment(1);
}

/// Publishes one gauge per resource name. Gauges for names seen before but
/// now absent are reset to zero.
pub(crate) fn record_resources(
    prefix: &str,
    current: &BTreeMap<String, f64>,
    previous: &BTreeMap<String, f64>,
) {
    for name in previous.keys().filter(|name| !current.contains_key(*name)) {
        gauge!(format!("{prefix}/{name}")).set(0.0);
    }
    for (name, value) in current {
        gauge!(format!("{prefix}/{name}")).set(*value);
    }
}
