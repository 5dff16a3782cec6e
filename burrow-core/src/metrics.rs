#![allow(missing_docs)] // lazy_static items dont play nicely with docstrings

//! # metrics
//!
//! counters and gauges for registration, discovery and session recovery
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// When the registry started
    pub static ref START_TIME: Instant = Instant::now();

    /// notifications taken off the event channel, by event type
    pub static ref EVENTS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "burrow_events_received",
        "notifications received from the coordination store",
        &["event_type"]
    )
    .unwrap();

    /// instances added to the cache by incremental apply
    pub static ref INSTANCES_ADDED: IntCounter = register_int_counter!("burrow_instances_added", "instances added by incremental apply").unwrap();
    /// instances removed from the cache by incremental apply
    pub static ref INSTANCES_REMOVED: IntCounter = register_int_counter!("burrow_instances_removed", "instances removed by incremental apply").unwrap();
    /// incremental updates that could not be applied
    pub static ref DROPPED_UPDATES: IntCounter = register_int_counter!("burrow_dropped_updates", "incremental updates dropped until the next full resync").unwrap();

    /// completed full resyncs
    pub static ref RESYNCS: IntCounter = register_int_counter!("burrow_resyncs", "completed full resyncs").unwrap();
    /// failed full resyncs
    pub static ref RESYNC_FAILURES: IntCounter = register_int_counter!("burrow_resync_failures", "failed full resyncs").unwrap();
    /// instances currently cached
    pub static ref CACHED_INSTANCES: IntGauge = register_int_gauge!("burrow_cached_instances", "instances in the local registry").unwrap();

    /// successful registrations of this process
    pub static ref REGISTRATIONS: IntCounter = register_int_counter!("burrow_registrations", "instance nodes created for this process").unwrap();

    /// recovery attempts started
    pub static ref RECOVERIES_STARTED: IntCounter = register_int_counter!("burrow_recoveries_started", "session recovery attempts started").unwrap();
    /// recovery attempts that failed
    pub static ref RECOVERIES_FAILED: IntCounter = register_int_counter!("burrow_recoveries_failed", "session recovery attempts that failed").unwrap();
    /// generation of the current session
    pub static ref SESSION_GENERATION: IntGauge = register_int_gauge!("burrow_session_generation", "publish generation of the current session").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{EVENTS_RECEIVED, RESYNCS, SESSION_GENERATION};

    #[test]
    fn metrics_are_registered_and_exposed() {
        EVENTS_RECEIVED.with_label_values(&["node_created"]).inc();
        RESYNCS.inc();
        SESSION_GENERATION.set(1);

        let names: HashSet<_> = gather()
            .into_iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        for name in [
            "burrow_events_received",
            "burrow_resyncs",
            "burrow_session_generation",
        ] {
            assert!(names.contains(name), "{name} missing from registry");
        }
    }
}
