// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use fleet_sync::{OperationKind, SyncConfig};
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.sync_interval_secs, 30);
//! assert_eq!(config.capacity_for(OperationKind::LocationUpdate), Some(1000));
//! assert_eq!(config.capacity_for(OperationKind::ProofOfDelivery), None);
//!
//! // Tuned for a constrained device
//! let config = SyncConfig {
//!     location_capacity: 250,
//!     max_in_flight: 2,
//!     ..Default::default()
//! };
//! assert_eq!(config.batch_size_for(OperationKind::ProofOfDelivery), 1);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::operation::OperationKind;
use crate::resilience::retry::BackoffPolicy;

/// Configuration for the offline queue and sync orchestrator.
///
/// All fields have defaults, so a host can deserialize a partial document.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Periodic sync trigger (default: 30 s)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Attempts before a record is forced to permanent failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff: min(base * 2^attempts, max), jittered
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay removed at random (0.0 disables, capped at 0.5)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Per-call remote submit timeout (default: 30 s)
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    /// Concurrent in-flight batches within a cycle
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Minimum spacing between admitted location samples per entity
    #[serde(default = "default_location_min_interval_secs")]
    pub location_min_interval_secs: u64,

    /// Per-kind capacities
    #[serde(default = "default_capacity")]
    pub location_capacity: usize,
    #[serde(default = "default_capacity")]
    pub delivery_status_capacity: usize,
    #[serde(default = "default_capacity")]
    pub route_state_capacity: usize,

    /// Proof of delivery is never evicted; growth past this is logged
    #[serde(default = "default_pod_warn_threshold")]
    pub pod_warn_threshold: usize,
    /// Optional hard stop for proof of delivery (None = unbounded)
    #[serde(default)]
    pub pod_hard_limit: Option<usize>,

    /// Batch sizes per kind
    #[serde(default = "default_location_batch_size")]
    pub location_batch_size: usize,
    #[serde(default = "default_status_batch_size")]
    pub delivery_status_batch_size: usize,
    #[serde(default = "default_status_batch_size")]
    pub route_state_batch_size: usize,
    #[serde(default = "default_pod_batch_size")]
    pub pod_batch_size: usize,

    /// Dead-letter log bound; oldest entries are dropped past it
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Run a final flush cycle during shutdown when online
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,
}

fn default_sync_interval_secs() -> u64 { 30 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 5 * 60 * 1_000 } // 5 minutes
fn default_backoff_jitter() -> f64 { 0.2 }
fn default_submit_timeout_secs() -> u64 { 30 }
fn default_max_in_flight() -> usize { 4 }
fn default_location_min_interval_secs() -> u64 { 30 }
fn default_capacity() -> usize { 1_000 }
fn default_pod_warn_threshold() -> usize { 200 }
fn default_location_batch_size() -> usize { 100 }
fn default_status_batch_size() -> usize { 20 }
fn default_pod_batch_size() -> usize { 1 }
fn default_dead_letter_capacity() -> usize { 500 }
fn default_flush_on_shutdown() -> bool { true }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_jitter: default_backoff_jitter(),
            submit_timeout_secs: default_submit_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            location_min_interval_secs: default_location_min_interval_secs(),
            location_capacity: default_capacity(),
            delivery_status_capacity: default_capacity(),
            route_state_capacity: default_capacity(),
            pod_warn_threshold: default_pod_warn_threshold(),
            pod_hard_limit: None,
            location_batch_size: default_location_batch_size(),
            delivery_status_batch_size: default_status_batch_size(),
            route_state_batch_size: default_status_batch_size(),
            pod_batch_size: default_pod_batch_size(),
            dead_letter_capacity: default_dead_letter_capacity(),
            flush_on_shutdown: default_flush_on_shutdown(),
        }
    }
}

impl SyncConfig {
    /// Eviction capacity for a kind. `None` means the kind is never evicted.
    #[must_use]
    pub fn capacity_for(&self, kind: OperationKind) -> Option<usize> {
        match kind {
            OperationKind::LocationUpdate => Some(self.location_capacity),
            OperationKind::DeliveryStatus => Some(self.delivery_status_capacity),
            OperationKind::RouteState => Some(self.route_state_capacity),
            OperationKind::ProofOfDelivery => None,
        }
    }

    /// Batch size for a kind, at least 1.
    #[must_use]
    pub fn batch_size_for(&self, kind: OperationKind) -> usize {
        let size = match kind {
            OperationKind::LocationUpdate => self.location_batch_size,
            OperationKind::DeliveryStatus => self.delivery_status_batch_size,
            OperationKind::RouteState => self.route_state_batch_size,
            OperationKind::ProofOfDelivery => self.pod_batch_size,
        };
        size.max(1)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    #[must_use]
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    #[must_use]
    pub fn location_min_interval(&self) -> Duration {
        Duration::from_secs(self.location_min_interval_secs)
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.backoff_jitter.clamp(0.0, BackoffPolicy::MAX_JITTER),
        }
    }
}
