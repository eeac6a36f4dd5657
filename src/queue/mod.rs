// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline queue.
//!
//! Durable, priority-aware holding area for mutations created while the device
//! may be disconnected. Every record is written through the
//! [`PersistenceAdapter`] before `enqueue` returns, so an acknowledged
//! mutation survives a crash.
//!
//! # Lanes
//!
//! Records live in one lane per [`OperationKind`], ordered by
//! `(created_at, seq)`. Kind priority is applied by the orchestrator, which
//! drains lanes in [`OperationKind::BY_PRIORITY`] order.
//!
//! ```text
//! enqueue ──► [lane] ──dequeue_batch──► SUBMITTING ──ack_success──► deleted
//!               ▲                           │
//!               │      ack_failure(transient, attempts < max)
//!               └──── PENDING + not_before ◄┘
//!                                           │
//!                    ack_failure(permanent) / escalate ──► dead letter
//! ```
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use fleet_sync::{OfflineQueue, OperationKind, SyncConfig, EnqueueOutcome};
//! use fleet_sync::clock::ManualClock;
//! use fleet_sync::storage::memory::InMemoryPersistence;
//!
//! let queue = OfflineQueue::new(
//!     SyncConfig::default(),
//!     Arc::new(InMemoryPersistence::new()),
//!     Arc::new(ManualClock::new(0)),
//! );
//!
//! let outcome = queue
//!     .enqueue(OperationKind::LocationUpdate, "vehicle-7", b"{}".to_vec(), 0)
//!     .await
//!     .unwrap();
//! assert!(outcome.is_admitted());
//!
//! // A second sample 5 s later is filtered, not an error
//! let outcome = queue
//!     .enqueue(OperationKind::LocationUpdate, "vehicle-7", b"{}".to_vec(), 5_000)
//!     .await
//!     .unwrap();
//! assert_eq!(outcome, EnqueueOutcome::Filtered);
//! assert_eq!(queue.size(OperationKind::LocationUpdate).await, 1);
//! # }
//! ```

pub mod pressure;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics;
use crate::operation::{
    FailureClass, LastError, OperationKind, OperationRecord, RecordId, RecordStatus,
};
use crate::resilience::retry::BackoffPolicy;
use crate::storage::PersistenceAdapter;

pub use pressure::QueuePressure;

/// Position of a record inside its lane.
type LaneKey = (i64, u64);

/// Result of a successful `enqueue` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Persisted and queued. `evicted` names the pending record dropped to make room.
    Admitted {
        id: RecordId,
        evicted: Option<RecordId>,
    },
    /// Location sample arrived inside the per-entity minimum interval.
    Filtered,
}

impl EnqueueOutcome {
    #[must_use]
    pub fn id(&self) -> Option<&RecordId> {
        match self {
            Self::Admitted { id, .. } => Some(id),
            Self::Filtered => None,
        }
    }

    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Failure classification passed to [`OfflineQueue::ack_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent {
        reason: String,
    },
}

impl Classification {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient { reason: reason.into(), retry_after: None }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent { reason: reason.into() }
    }
}

/// Where a failed record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `PENDING`, not eligible before the given epoch millis.
    Retrying { not_before: i64 },
    DeadLettered,
}

/// Summary of [`OfflineQueue::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Live records restored into lanes
    pub restored: usize,
    /// Records found `SUBMITTING` (crash mid-flight) and reset to `PENDING`
    pub reset_in_flight: usize,
    /// Records dropped because a lane exceeded its capacity
    pub evicted: usize,
    pub dead_letter: usize,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<OperationKind, BTreeMap<LaneKey, OperationRecord>>,
    index: HashMap<RecordId, (OperationKind, LaneKey)>,
    dead_letter: VecDeque<OperationRecord>,
    /// created_at of the last admitted location sample per entity
    last_location: HashMap<String, i64>,
    next_seq: u64,
}

impl QueueState {
    fn lane_len(&self, kind: OperationKind) -> usize {
        self.lanes.get(&kind).map_or(0, BTreeMap::len)
    }

    fn insert(&mut self, record: OperationRecord) {
        let key = (record.created_at, record.seq);
        self.index.insert(record.id.clone(), (record.kind, key));
        self.lanes.entry(record.kind).or_default().insert(key, record);
    }

    fn remove(&mut self, id: &RecordId) -> Option<OperationRecord> {
        let (kind, key) = self.index.remove(id)?;
        self.lanes.get_mut(&kind)?.remove(&key)
    }

    fn get_mut(&mut self, id: &RecordId) -> Option<&mut OperationRecord> {
        let (kind, key) = self.index.get(id)?;
        self.lanes.get_mut(kind)?.get_mut(key)
    }

    /// Drop dead-letter entries beyond `capacity`, oldest first. Proof of
    /// delivery is never dropped, so the log may stay over capacity.
    fn trim_dead_letter(&mut self, capacity: usize) -> Vec<OperationRecord> {
        let mut dropped = Vec::new();
        while self.dead_letter.len() > capacity {
            let Some(pos) = self
                .dead_letter
                .iter()
                .position(|r| r.kind != OperationKind::ProofOfDelivery)
            else {
                break;
            };
            dropped.extend(self.dead_letter.remove(pos));
        }
        dropped
    }

    fn oldest_pending(&self, kind: OperationKind) -> Option<RecordId> {
        self.lanes
            .get(&kind)?
            .values()
            .find(|r| r.status == RecordStatus::Pending)
            .map(|r| r.id.clone())
    }
}

/// Durable, bounded, priority-aware queue of operation records.
pub struct OfflineQueue {
    config: SyncConfig,
    backoff: BackoffPolicy,
    persistence: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl OfflineQueue {
    pub fn new(
        config: SyncConfig,
        persistence: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backoff = config.backoff_policy();
        Self {
            config,
            backoff,
            persistence,
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Admit a mutation. Returns once the record is persisted.
    #[tracing::instrument(skip_all, fields(kind = %kind))]
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
        created_at: i64,
    ) -> Result<EnqueueOutcome, SyncError> {
        let entity_id = entity_id.into();
        if entity_id.trim().is_empty() {
            metrics::record_enqueue(kind, "invalid");
            return Err(SyncError::InvalidOperation("entity_id must not be empty".into()));
        }
        if payload.is_empty() {
            metrics::record_enqueue(kind, "invalid");
            return Err(SyncError::InvalidOperation(format!(
                "empty payload for {kind} on '{entity_id}'"
            )));
        }

        let mut state = self.state.lock().await;

        if kind == OperationKind::LocationUpdate {
            if let Some(&last) = state.last_location.get(&entity_id) {
                let min_gap = self.config.location_min_interval().as_millis() as i64;
                if created_at.saturating_sub(last) < min_gap {
                    debug!(entity_id = %entity_id, created_at, last, "Location sample inside minimum interval, filtered");
                    metrics::record_enqueue(kind, "filtered");
                    return Ok(EnqueueOutcome::Filtered);
                }
            }
        }

        let victim = self.admission_victim(&state, kind)?;

        let mut record = OperationRecord::new(kind, entity_id, payload, created_at);
        record.seq = state.next_seq;

        if let Err(e) = self.persistence.save(&record).await {
            metrics::record_persistence_error("save");
            metrics::record_enqueue(kind, "rejected");
            error!(entity_id = %record.entity_id, error = %e, "Failed to persist enqueued record");
            return Err(e.into());
        }
        state.next_seq += 1;

        let evicted = match victim {
            Some(victim_id) => match state.remove(&victim_id) {
                Some(old) => {
                    warn!(
                        evicted = %old.id,
                        entity_id = %old.entity_id,
                        created_at = old.created_at,
                        "Queue at capacity, evicted oldest pending record"
                    );
                    metrics::record_eviction(kind);
                    self.forget(&old.id, "evict").await;
                    Some(old.id)
                }
                None => None,
            },
            None => None,
        };

        if kind == OperationKind::LocationUpdate {
            state.last_location.insert(record.entity_id.clone(), created_at);
        }

        let id = record.id.clone();
        debug!(id = %id, entity_id = %record.entity_id, seq = record.seq, "Record enqueued");
        state.insert(record);
        metrics::record_enqueue(kind, "admitted");
        self.publish_depth(&state, kind);

        Ok(EnqueueOutcome::Admitted { id, evicted })
    }

    /// Decide whether admitting one more record of `kind` needs an eviction.
    fn admission_victim(
        &self,
        state: &QueueState,
        kind: OperationKind,
    ) -> Result<Option<RecordId>, SyncError> {
        let len = state.lane_len(kind);

        let Some(capacity) = self.config.capacity_for(kind) else {
            if let Some(limit) = self.config.pod_hard_limit {
                if len >= limit {
                    metrics::record_enqueue(kind, "rejected");
                    warn!(pending = len, limit, "Proof-of-delivery hard limit reached");
                    return Err(SyncError::CapacityExceeded { kind, limit });
                }
            }
            if len >= self.config.pod_warn_threshold {
                warn!(
                    pending = len,
                    threshold = self.config.pod_warn_threshold,
                    "Proof-of-delivery backlog above soft limit"
                );
            }
            return Ok(None);
        };

        if len < capacity {
            return Ok(None);
        }

        match state.oldest_pending(kind) {
            Some(id) => Ok(Some(id)),
            None => {
                metrics::record_enqueue(kind, "rejected");
                warn!(pending = len, capacity, "Queue full and nothing evictable");
                Err(SyncError::CapacityExceeded { kind, limit: capacity })
            }
        }
    }

    /// Up to `max_count` ready records of `kind`, oldest first, marked `SUBMITTING`.
    ///
    /// A record is held back while an earlier record of the same entity is
    /// backing off or in flight, so each entity's records reach the server in
    /// enqueue order.
    pub async fn dequeue_batch(&self, kind: OperationKind, max_count: usize) -> Vec<OperationRecord> {
        if max_count == 0 {
            return Vec::new();
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;

        let mut batch = Vec::new();
        if let Some(lane) = state.lanes.get_mut(&kind) {
            let mut held: HashSet<String> = HashSet::new();
            for record in lane.values_mut() {
                if batch.len() >= max_count {
                    break;
                }
                if held.contains(&record.entity_id) {
                    continue;
                }
                if record.is_ready(now) {
                    record.status = RecordStatus::Submitting;
                    batch.push(record.clone());
                } else {
                    held.insert(record.entity_id.clone());
                }
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.persistence.save_batch(&batch).await {
                metrics::record_persistence_error("save_batch");
                error!(kind = %kind, count = batch.len(), error = %e, "Failed to persist SUBMITTING transition");
            }
        }
        batch
    }

    /// Remove synced records. Unknown ids are ignored, so repeated acks are harmless.
    pub async fn ack_success(&self, ids: &[RecordId]) -> usize {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        let mut touched = Vec::new();

        for id in ids {
            let Some(mut record) = state.remove(id) else {
                debug!(id = %id, "Ack for unknown record ignored");
                continue;
            };
            record.status = RecordStatus::Synced;
            debug!(id = %id, kind = %record.kind, attempts = record.attempts, "Record synced");
            self.forget(&record.id, "delete").await;
            if !touched.contains(&record.kind) {
                touched.push(record.kind);
            }
            removed += 1;
        }

        for kind in touched {
            self.publish_depth(&state, kind);
        }
        removed
    }

    /// Record a failed submission. `None` when the id is unknown.
    pub async fn ack_failure(
        &self,
        id: &RecordId,
        classification: Classification,
    ) -> Option<FailureDisposition> {
        let now = self.clock.now_millis();
        let max = self.config.max_attempts.max(1);
        let mut state = self.state.lock().await;

        let attempts = {
            let record = state.get_mut(id)?;
            record.attempts = record.attempts.saturating_add(1).min(max);
            record.attempts
        };

        match classification {
            Classification::Transient { reason, retry_after } if attempts < max => {
                let delay = self.backoff.next_delay(attempts, retry_after);
                let not_before = now.saturating_add(delay.as_millis() as i64);

                let snapshot = {
                    let record = state.get_mut(id)?;
                    record.status = RecordStatus::FailedTransient;
                    record.last_error = Some(LastError::new(FailureClass::Transient, reason));
                    record.status = RecordStatus::Pending;
                    record.not_before = Some(not_before);
                    record.clone()
                };
                self.persist(&snapshot, "save").await;
                debug!(
                    id = %id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, backing off"
                );
                Some(FailureDisposition::Retrying { not_before })
            }
            Classification::Transient { reason, .. } => {
                let message = format!("max attempts ({max}) exhausted: {reason}");
                self.move_to_dead_letter(&mut state, id, LastError::new(FailureClass::Permanent, message))
                    .await?;
                Some(FailureDisposition::DeadLettered)
            }
            Classification::Permanent { reason } => {
                self.move_to_dead_letter(&mut state, id, LastError::new(FailureClass::Permanent, reason))
                    .await?;
                Some(FailureDisposition::DeadLettered)
            }
        }
    }

    /// Conflict resolved as retry: count the attempt, swap in the merged
    /// payload when there is one, and make the record immediately eligible.
    pub async fn requeue_merged(
        &self,
        id: &RecordId,
        merged_payload: Option<Vec<u8>>,
    ) -> Option<FailureDisposition> {
        let now = self.clock.now_millis();
        let max = self.config.max_attempts.max(1);
        let mut state = self.state.lock().await;

        let snapshot = {
            let record = state.get_mut(id)?;
            record.attempts = record.attempts.saturating_add(1).min(max);
            if record.attempts < max {
                if let Some(payload) = merged_payload {
                    record.payload = payload;
                }
                record.status = RecordStatus::Pending;
                record.not_before = None;
                record.last_error = Some(LastError::new(
                    FailureClass::Conflict,
                    "resubmitting against newer server state",
                ));
                Some(record.clone())
            } else {
                None
            }
        };

        match snapshot {
            Some(record) => {
                self.persist(&record, "save").await;
                debug!(id = %id, attempts = record.attempts, "Conflict resolved as retry");
                Some(FailureDisposition::Retrying { not_before: now })
            }
            None => {
                let error = LastError::new(
                    FailureClass::Conflict,
                    format!("conflict unresolved after {max} attempts"),
                );
                self.move_to_dead_letter(&mut state, id, error).await?;
                Some(FailureDisposition::DeadLettered)
            }
        }
    }

    /// Conflict resolved as escalate: keep the local record for the user in the dead letter.
    pub async fn escalate(&self, id: &RecordId, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock().await;
        self.move_to_dead_letter(&mut state, id, LastError::new(FailureClass::Conflict, reason))
            .await
            .is_some()
    }

    /// Conflict resolved as discard: the server state stands, drop the local record.
    pub async fn discard(&self, id: &RecordId) -> bool {
        let mut state = self.state.lock().await;
        let Some(record) = state.remove(id) else {
            return false;
        };
        info!(id = %id, kind = %record.kind, entity_id = %record.entity_id, "Local record superseded by server state");
        self.forget(id, "delete").await;
        self.publish_depth(&state, record.kind);
        true
    }

    /// Return dequeued-but-unsent records to `PENDING` without counting an attempt.
    pub async fn release(&self, ids: &[RecordId]) -> usize {
        let mut state = self.state.lock().await;
        let mut released = Vec::new();
        for id in ids {
            if let Some(record) = state.get_mut(id) {
                if record.status == RecordStatus::Submitting {
                    record.status = RecordStatus::Pending;
                    released.push(record.clone());
                }
            }
        }
        if !released.is_empty() {
            if let Err(e) = self.persistence.save_batch(&released).await {
                metrics::record_persistence_error("save_batch");
                error!(count = released.len(), error = %e, "Failed to persist released records");
            }
            debug!(count = released.len(), "Released unsent records");
        }
        released.len()
    }

    /// Return every `SUBMITTING` record to `PENDING`. Used once all
    /// submissions of a cycle have finished, so anything still in flight was
    /// orphaned by a failed worker.
    pub async fn release_orphans(&self) -> usize {
        let ids: Vec<RecordId> = {
            let state = self.state.lock().await;
            state
                .lanes
                .values()
                .flat_map(BTreeMap::values)
                .filter(|r| r.status == RecordStatus::Submitting)
                .map(|r| r.id.clone())
                .collect()
        };
        if ids.is_empty() {
            return 0;
        }
        let released = self.release(&ids).await;
        warn!(released, "Released records orphaned mid-submission");
        released
    }

    /// Live records (pending + submitting) of `kind`.
    pub async fn size(&self, kind: OperationKind) -> usize {
        self.state.lock().await.lane_len(kind)
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.index.is_empty()
    }

    /// Live records across all kinds.
    pub async fn total_size(&self) -> usize {
        self.state.lock().await.index.len()
    }

    /// Snapshot of the dead-letter log, oldest first.
    pub async fn dead_letter_entries(&self) -> Vec<OperationRecord> {
        self.state.lock().await.dead_letter.iter().cloned().collect()
    }

    /// Snapshot of one lane in dequeue order.
    pub async fn records(&self, kind: OperationKind) -> Vec<OperationRecord> {
        let state = self.state.lock().await;
        state
            .lanes
            .get(&kind)
            .map(|lane| lane.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn pressure(&self, kind: OperationKind) -> QueuePressure {
        let state = self.state.lock().await;
        self.pressure_of(&state, kind)
    }

    /// Rebuild in-memory state from persistence. Run once at startup, before
    /// the first enqueue.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, SyncError> {
        let mut state = self.state.lock().await;
        let mut fresh = QueueState::default();
        let mut report = RecoveryReport::default();
        let mut to_save = Vec::new();
        let mut to_delete = Vec::new();

        for kind in OperationKind::BY_PRIORITY {
            for mut record in self.persistence.load_pending(kind).await? {
                fresh.next_seq = fresh.next_seq.max(record.seq.saturating_add(1));
                match record.status {
                    RecordStatus::Synced => {
                        to_delete.push(record.id);
                        continue;
                    }
                    RecordStatus::FailedPermanent => continue,
                    RecordStatus::Submitting | RecordStatus::FailedTransient => {
                        record.status = RecordStatus::Pending;
                        report.reset_in_flight += 1;
                        to_save.push(record.clone());
                    }
                    RecordStatus::Pending => {}
                }
                if kind == OperationKind::LocationUpdate {
                    let last = fresh.last_location.entry(record.entity_id.clone()).or_insert(record.created_at);
                    *last = (*last).max(record.created_at);
                }
                fresh.insert(record);
                report.restored += 1;
            }

            if let Some(capacity) = self.config.capacity_for(kind) {
                while fresh.lane_len(kind) > capacity {
                    let Some(id) = fresh.oldest_pending(kind) else { break };
                    fresh.remove(&id);
                    to_delete.push(id);
                    report.evicted += 1;
                    report.restored -= 1;
                }
            }
        }

        for record in self.persistence.load_dead_letter().await? {
            fresh.next_seq = fresh.next_seq.max(record.seq.saturating_add(1));
            fresh.dead_letter.push_back(record);
        }
        for dropped in fresh.trim_dead_letter(self.config.dead_letter_capacity) {
            to_delete.push(dropped.id);
        }
        report.dead_letter = fresh.dead_letter.len();

        if !to_save.is_empty() {
            self.persistence.save_batch(&to_save).await?;
        }
        for id in &to_delete {
            self.forget(id, "delete").await;
        }

        *state = fresh;
        for kind in OperationKind::BY_PRIORITY {
            self.publish_depth(&state, kind);
        }
        metrics::set_dead_letter_size(state.dead_letter.len());
        metrics::record_recovery(report.restored, report.reset_in_flight);
        info!(
            restored = report.restored,
            reset_in_flight = report.reset_in_flight,
            evicted = report.evicted,
            dead_letter = report.dead_letter,
            "Queue recovered from persistence"
        );
        Ok(report)
    }

    async fn move_to_dead_letter(
        &self,
        state: &mut QueueState,
        id: &RecordId,
        error: LastError,
    ) -> Option<()> {
        let mut record = state.remove(id)?;
        record.status = RecordStatus::FailedPermanent;
        record.not_before = None;
        // Dead-letter order survives a restart through seq
        record.seq = state.next_seq;
        state.next_seq += 1;
        let class = error.class;
        record.last_error = Some(error);
        self.persist(&record, "save").await;

        warn!(
            id = %record.id,
            kind = %record.kind,
            entity_id = %record.entity_id,
            attempts = record.attempts,
            class = %class,
            "Record moved to dead letter"
        );
        metrics::record_dead_letter(record.kind, &class.to_string());
        let kind = record.kind;
        state.dead_letter.push_back(record);

        let capacity = self.config.dead_letter_capacity;
        for dropped in state.trim_dead_letter(capacity) {
            warn!(id = %dropped.id, kind = %dropped.kind, "Dead-letter log full, dropping oldest entry");
            self.forget(&dropped.id, "delete").await;
        }
        if state.dead_letter.len() > capacity {
            warn!(
                entries = state.dead_letter.len(),
                capacity,
                "Dead-letter log over capacity, keeping proof-of-delivery entries"
            );
        }

        metrics::set_dead_letter_size(state.dead_letter.len());
        self.publish_depth(state, kind);
        Some(())
    }

    async fn persist(&self, record: &OperationRecord, op: &'static str) {
        if let Err(e) = self.persistence.save(record).await {
            metrics::record_persistence_error(op);
            error!(id = %record.id, status = %record.status, error = %e, "Failed to persist record transition");
        }
    }

    async fn forget(&self, id: &RecordId, op: &'static str) {
        if let Err(e) = self.persistence.delete(id).await {
            metrics::record_persistence_error(op);
            error!(id = %id, error = %e, "Failed to delete record from persistence");
        }
    }

    fn pressure_of(&self, state: &QueueState, kind: OperationKind) -> QueuePressure {
        let len = state.lane_len(kind);
        match self.config.capacity_for(kind) {
            Some(capacity) => QueuePressure::from_fill(len, capacity),
            None => QueuePressure::for_proof(len, self.config.pod_warn_threshold, self.config.pod_hard_limit),
        }
    }

    fn publish_depth(&self, state: &QueueState, kind: OperationKind) {
        metrics::set_queue_depth(kind, state.lane_len(kind));
        metrics::set_queue_pressure(kind, self.pressure_of(state, kind) as u8);
    }
}
