// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for fleet-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `fleet_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `kind`: LOCATION_UPDATE, DELIVERY_STATUS, PROOF_OF_DELIVERY, ROUTE_STATE
//! - `outcome`: success, conflict, transient, permanent, ...
//! - `operation`: save, delete, load, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::operation::OperationKind;

/// Enqueue result: admitted, filtered, rejected, invalid
pub fn record_enqueue(kind: OperationKind, outcome: &str) {
    counter!(
        "fleet_sync_enqueue_total",
        "kind" => kind.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A pending record was evicted to make room
pub fn record_eviction(kind: OperationKind) {
    counter!("fleet_sync_evictions_total", "kind" => kind.as_str()).increment(1);
}

/// Current live records (pending + submitting) for a kind
pub fn set_queue_depth(kind: OperationKind, depth: usize) {
    gauge!("fleet_sync_queue_depth", "kind" => kind.as_str()).set(depth as f64);
}

pub fn set_dead_letter_size(count: usize) {
    gauge!("fleet_sync_dead_letter_entries").set(count as f64);
}

/// Records moved to the dead-letter log, by failure class
pub fn record_dead_letter(kind: OperationKind, class: &str) {
    counter!(
        "fleet_sync_dead_lettered_total",
        "kind" => kind.as_str(),
        "class" => class.to_string()
    )
    .increment(1);
}

/// Queue pressure level (0 = normal, 1 = warn, 2 = full)
pub fn set_queue_pressure(kind: OperationKind, level: u8) {
    gauge!("fleet_sync_queue_pressure", "kind" => kind.as_str()).set(f64::from(level));
}

/// Persistence adapter call failed
pub fn record_persistence_error(operation: &str) {
    counter!(
        "fleet_sync_persistence_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Per-record submission outcome
pub fn record_submission(kind: OperationKind, outcome: &str) {
    counter!(
        "fleet_sync_submissions_total",
        "kind" => kind.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_batch_size(kind: OperationKind, count: usize) {
    histogram!("fleet_sync_batch_size", "kind" => kind.as_str()).record(count as f64);
}

/// Record submit latency
pub fn record_submit_latency(kind: OperationKind, duration: Duration) {
    histogram!("fleet_sync_submit_seconds", "kind" => kind.as_str()).record(duration.as_secs_f64());
}

pub fn record_submit_timeout(kind: OperationKind) {
    counter!("fleet_sync_submit_timeouts_total", "kind" => kind.as_str()).increment(1);
}

/// Conflict resolution action: retry, discard, escalate
pub fn record_conflict(kind: OperationKind, action: &str) {
    counter!(
        "fleet_sync_conflicts_total",
        "kind" => kind.as_str(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Cycle end: completed, aborted
pub fn record_cycle(outcome: &str, duration: Duration) {
    counter!("fleet_sync_cycles_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("fleet_sync_cycle_seconds").record(duration.as_secs_f64());
}

/// A trigger arrived while a cycle was running
pub fn record_coalesced_trigger(source: &str) {
    counter!(
        "fleet_sync_coalesced_triggers_total",
        "source" => source.to_string()
    )
    .increment(1);
}

pub fn set_engine_state(state: &str) {
    counter!("fleet_sync_state_transitions_total", "state" => state.to_string()).increment(1);
}

/// Records restored during startup recovery
pub fn record_recovery(restored: usize, reset_in_flight: usize) {
    counter!("fleet_sync_recovered_records_total").increment(restored as u64);
    counter!("fleet_sync_recovered_in_flight_total").increment(reset_in_flight as u64);
}

/// Timer that records submit latency on drop
pub struct LatencyTimer {
    kind: OperationKind,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_submit_latency(self.kind, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests verify the API doesn't panic without an installed recorder.

    #[test]
    fn test_queue_metrics() {
        record_enqueue(OperationKind::LocationUpdate, "admitted");
        record_enqueue(OperationKind::LocationUpdate, "filtered");
        record_eviction(OperationKind::DeliveryStatus);
        set_queue_depth(OperationKind::RouteState, 12);
        set_queue_pressure(OperationKind::LocationUpdate, 1);
        set_dead_letter_size(3);
        record_dead_letter(OperationKind::ProofOfDelivery, "conflict");
        record_persistence_error("save");
    }

    #[test]
    fn test_submission_metrics() {
        record_submission(OperationKind::DeliveryStatus, "success");
        record_batch_size(OperationKind::LocationUpdate, 100);
        record_submit_timeout(OperationKind::ProofOfDelivery);
        record_conflict(OperationKind::DeliveryStatus, "discard");
        record_cycle("completed", Duration::from_millis(250));
        record_coalesced_trigger("manual");
        set_engine_state("running");
        record_recovery(10, 2);
    }

    #[test]
    fn test_latency_timer() {
        let _timer = LatencyTimer::new(OperationKind::RouteState);
        std::thread::sleep(Duration::from_millis(1));
    }
}
