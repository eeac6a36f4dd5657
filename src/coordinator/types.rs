// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync orchestrator.

use std::sync::Arc;
use std::time::Duration;

/// Orchestrator state, the single authority on whether a cycle is running.
///
/// ```text
/// Idle → Running → { Completed | Aborted }
///          ▲              │
///          └── trigger ───┘
/// ```
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle has run yet
    Idle,
    /// A cycle owns the queue
    Running,
    /// Last cycle finished (possibly with partial progress)
    Completed,
    /// Last cycle found the device offline and did nothing
    Aborted,
}

impl SyncState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// What asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Timer,
    /// Offline → online edge
    Network,
    Manual,
    /// Final flush during shutdown
    Shutdown,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Network => "network",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Why a cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// Every kind was drained of ready records
    Drained,
    /// Connectivity dropped mid-cycle; remaining records wait for the next one
    NetworkLost,
    /// [`super::SyncEngine::cancel_cycle()`] was called
    Cancelled,
    /// Offline when the cycle began
    Offline,
}

impl std::fmt::Display for CycleEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drained => write!(f, "drained"),
            Self::NetworkLost => write!(f, "network lost"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Per-record tallies of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: TriggerSource,
    pub end: CycleEnd,
    pub batches: usize,
    /// Records handed to the submitter
    pub submitted: usize,
    pub synced: usize,
    /// Back to pending: transient backoff or conflict retry
    pub retried: usize,
    pub dead_lettered: usize,
    pub conflicts: usize,
    /// Conflicts where the server state stood
    pub discarded: usize,
    /// Submit calls that hit the timeout
    pub timeouts: usize,
    /// Dequeued but never sent
    pub released: usize,
    /// Accepted, but queued again behind an earlier record of the same
    /// entity that is being retried
    pub deferred: usize,
    pub duration: Duration,
}

impl CycleReport {
    pub(super) fn new(trigger: TriggerSource) -> Self {
        Self {
            trigger,
            end: CycleEnd::Drained,
            batches: 0,
            submitted: 0,
            synced: 0,
            retried: 0,
            dead_lettered: 0,
            conflicts: 0,
            discarded: 0,
            timeouts: 0,
            released: 0,
            deferred: 0,
            duration: Duration::ZERO,
        }
    }

    pub(super) fn absorb(&mut self, tally: BatchTally) {
        self.submitted += tally.submitted;
        self.synced += tally.synced;
        self.retried += tally.retried;
        self.dead_lettered += tally.dead_lettered;
        self.conflicts += tally.conflicts;
        self.discarded += tally.discarded;
        self.timeouts += tally.timeouts;
        self.deferred += tally.deferred;
    }

    /// Stopped before draining the queue.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.end != CycleEnd::Drained
    }
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Aborted(CycleReport),
    /// A cycle was already running; this request was folded into it
    Coalesced,
}

impl CycleOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Completed(r) | Self::Aborted(r) => Some(r),
            Self::Coalesced => None,
        }
    }

    #[must_use]
    pub fn is_coalesced(&self) -> bool {
        matches!(self, Self::Coalesced)
    }
}

/// Called with the report of every cycle that ran.
pub type CompletionCallback = Arc<dyn Fn(&CycleReport) + Send + Sync>;

/// Tallies of one submitted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct BatchTally {
    pub submitted: usize,
    pub synced: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub conflicts: usize,
    pub discarded: usize,
    pub timeouts: usize,
    pub deferred: usize,
}
