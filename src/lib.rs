// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Fleet Sync
//!
//! Offline-first mutation queue and sync orchestrator for fleet tracking
//! clients: drivers keep working without connectivity, and their location
//! samples, delivery status changes, proofs of delivery and route updates
//! reach the server once the device is back online.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Offline Queue                          │
//! │  • Write-through persistence before enqueue returns        │
//! │  • Per-kind capacity with oldest-first eviction            │
//! │  • Proof of delivery never evicted                         │
//! │  • Exponential backoff, dead letter for permanent failures │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (timer / reconnect / manual trigger)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Sync Orchestrator                        │
//! │  • One cycle at a time, extra triggers coalesced           │
//! │  • Kinds drained by priority: POD → status → route → GPS   │
//! │  • Bounded in-flight batches, one batch per entity         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                      (409-style conflicts)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Conflict Resolver                         │
//! │  • Terminal status outranks in-progress                    │
//! │  • Last-write-wins otherwise                               │
//! │  • Proof of delivery escalated, never dropped              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host supplies three collaborators: a [`PersistenceAdapter`]
//! (in-memory and SQLite ones ship here), a [`RemoteSubmitter`] for the
//! server API, and a [`NetworkStateSource`] fed by the platform's
//! connectivity callbacks.
//!
//! ## Modules
//!
//! - [`queue`]: The [`OfflineQueue`]
//! - [`coordinator`]: The [`SyncEngine`] orchestrating cycles
//! - [`resolver`]: Conflict policy
//! - [`storage`]: Persistence adapters (memory, SQLite)
//! - [`resilience`]: Backoff and startup retry
//! - [`payload`]: Typed payloads for each operation kind

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod network;
pub mod operation;
pub mod payload;
pub mod queue;
pub mod remote;
pub mod resilience;
pub mod resolver;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use coordinator::{CycleEnd, CycleOutcome, CycleReport, SyncEngine, SyncState, TriggerSource};
pub use error::{SubmissionError, SyncError};
pub use network::{NetworkStateSource, WatchNetwork};
pub use operation::{FailureClass, LastError, OperationKind, OperationRecord, RecordId, RecordStatus};
pub use queue::{Classification, EnqueueOutcome, FailureDisposition, OfflineQueue, QueuePressure, RecoveryReport};
pub use remote::{RemoteSubmitter, ServerState, SubmitOutcome};
pub use resilience::retry::{BackoffPolicy, RetryConfig};
pub use resolver::{ConflictAction, ConflictContext, ConflictResolver, Resolution};
pub use storage::{PersistenceAdapter, StorageError};
