// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One sync cycle: drain kinds in priority order through a bounded worker pool.
//!
//! Kinds are drained one at a time. Within a kind, up to `max_in_flight`
//! batches are on the wire at once, subject to the [`EntityGate`]. A batch
//! whose entities are busy goes back to the queue rather than stalling
//! dispatch. A kind is done when a dequeue comes back empty and nothing of it
//! is still in flight.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::metrics::{self, LatencyTimer};
use crate::operation::{OperationKind, OperationRecord, RecordId};
use crate::queue::{Classification, FailureDisposition, OfflineQueue};
use crate::error::SubmissionError;
use crate::remote::{RemoteSubmitter, SubmitOutcome};
use crate::resolver::{ConflictAction, ConflictContext, ConflictResolver};

use super::entity_gate::EntityGate;
use super::types::{BatchTally, CycleEnd, CycleOutcome, CycleReport, SyncState, TriggerSource};
use super::SyncEngine;

/// What a submission worker needs, shared across the batches of a cycle.
struct BatchContext {
    queue: Arc<OfflineQueue>,
    submitter: Arc<dyn RemoteSubmitter>,
    resolver: ConflictResolver,
    submit_timeout: Duration,
}

/// Puts the state back to `Idle` if a cycle unwinds without finishing.
struct CycleGuard<'a> {
    engine: &'a SyncEngine,
    finished: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.state.send_if_modified(|s| {
                if s.is_running() {
                    *s = SyncState::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl SyncEngine {
    /// Claim the single cycle slot. `false` means a cycle is already running.
    pub(super) fn try_begin(&self) -> bool {
        let claimed = self.state.send_if_modified(|s| {
            if s.is_running() {
                false
            } else {
                *s = SyncState::Running;
                true
            }
        });
        if claimed {
            self.cancel.store(false, Ordering::SeqCst);
            metrics::set_engine_state("running");
        }
        claimed
    }

    /// Run a cycle whose slot was claimed with [`try_begin`](Self::try_begin).
    #[tracing::instrument(skip(self, source), fields(trigger = source.as_str()))]
    pub(super) async fn execute_cycle(&self, source: TriggerSource) -> CycleOutcome {
        let mut guard = CycleGuard { engine: self, finished: false };
        let started = Instant::now();
        let mut report = CycleReport::new(source);

        let final_state = if self.network.is_online() {
            debug!("Sync cycle started");
            self.drain(&mut report).await;
            SyncState::Completed
        } else {
            debug!("Offline, sync cycle aborted");
            report.end = CycleEnd::Offline;
            SyncState::Aborted
        };

        report.duration = started.elapsed();
        let label = match final_state {
            SyncState::Aborted => "aborted",
            _ => "completed",
        };
        metrics::record_cycle(label, report.duration);
        metrics::set_engine_state(label);

        if final_state == SyncState::Completed {
            info!(
                end = %report.end,
                batches = report.batches,
                submitted = report.submitted,
                synced = report.synced,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                conflicts = report.conflicts,
                duration_ms = report.duration.as_millis() as u64,
                "Sync cycle completed"
            );
        }

        self.notify_completion(&report);
        self.state.send_replace(final_state);
        guard.finished = true;

        match final_state {
            SyncState::Aborted => CycleOutcome::Aborted(report),
            _ => CycleOutcome::Completed(report),
        }
    }

    /// Checked before every dequeue and again before every dispatch.
    fn interruption(&self) -> Option<CycleEnd> {
        if self.cancel.load(Ordering::SeqCst) {
            return Some(CycleEnd::Cancelled);
        }
        if !self.network.is_online() {
            return Some(CycleEnd::NetworkLost);
        }
        None
    }

    async fn drain(&self, report: &mut CycleReport) {
        let ctx = Arc::new(BatchContext {
            queue: self.queue.clone(),
            submitter: self.submitter.clone(),
            resolver: self.resolver,
            submit_timeout: self.config.submit_timeout(),
        });
        let gate = EntityGate::new();
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut in_flight: JoinSet<BatchTally> = JoinSet::new();

        'kinds: for kind in OperationKind::BY_PRIORITY {
            let batch_size = self.config.batch_size_for(kind);

            loop {
                if let Some(end) = self.interruption() {
                    info!(end = %end, kind = %kind, "Sync cycle stopping early");
                    report.end = end;
                    break 'kinds;
                }

                let batch = self.queue.dequeue_batch(kind, batch_size).await;
                if batch.is_empty() {
                    // In-flight batches can hand records back (conflict retry)
                    match in_flight.join_next().await {
                        Some(joined) => {
                            absorb(report, joined);
                            continue;
                        }
                        None => break,
                    }
                }

                let Some(pass) = gate.try_acquire(&batch) else {
                    let ids: Vec<RecordId> = batch.iter().map(|r| r.id.clone()).collect();
                    self.queue.release(&ids).await;
                    debug!(kind = %kind, size = ids.len(), "Batch entities busy, waiting for an in-flight batch");
                    if let Some(joined) = in_flight.join_next().await {
                        absorb(report, joined);
                    }
                    continue;
                };
                let permit = permits.clone().acquire_owned().await;

                let interrupted = self.interruption();
                let permit = match (permit, interrupted) {
                    (Ok(permit), None) => permit,
                    (_, end) => {
                        let ids: Vec<RecordId> = batch.iter().map(|r| r.id.clone()).collect();
                        report.released += self.queue.release(&ids).await;
                        report.end = end.unwrap_or(CycleEnd::Cancelled);
                        info!(end = %report.end, kind = %kind, released = ids.len(), "Sync cycle stopping early");
                        break 'kinds;
                    }
                };

                report.batches += 1;
                metrics::record_batch_size(kind, batch.len());
                debug!(kind = %kind, size = batch.len(), "Dispatching batch");

                let ctx = ctx.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    let _pass = pass;
                    ctx.submit_batch(kind, batch).await
                });
            }
        }

        // Cancellation and network loss let in-flight submissions finish
        while let Some(joined) = in_flight.join_next().await {
            absorb(report, joined);
        }

        report.released += self.queue.release_orphans().await;
    }
}

fn absorb(report: &mut CycleReport, joined: Result<BatchTally, tokio::task::JoinError>) {
    match joined {
        Ok(tally) => report.absorb(tally),
        Err(e) => error!(error = %e, "Submission worker failed"),
    }
}

impl BatchContext {
    async fn submit_batch(&self, kind: OperationKind, batch: Vec<OperationRecord>) -> BatchTally {
        let mut tally = BatchTally { submitted: batch.len(), ..Default::default() };

        let result = {
            let _timer = LatencyTimer::new(kind);
            tokio::time::timeout(self.submit_timeout, self.submitter.submit(&batch)).await
        };

        let outcomes: Vec<SubmitOutcome> = match result {
            Ok(Ok(mut outcomes)) => {
                if outcomes.len() != batch.len() {
                    warn!(
                        kind = %kind,
                        expected = batch.len(),
                        got = outcomes.len(),
                        "Submitter returned wrong number of outcomes"
                    );
                    outcomes.resize(batch.len(), SubmitOutcome::transient("no outcome reported for record"));
                }
                outcomes
            }
            Ok(Err(SubmissionError::Conflict(server))) => {
                debug!(kind = %kind, entity_id = %server.entity_id, "Whole batch rejected on conflict");
                batch
                    .iter()
                    .map(|record| {
                        if record.entity_id == server.entity_id {
                            SubmitOutcome::Conflict(server.clone())
                        } else {
                            SubmitOutcome::transient(format!("batch rejected on conflict with '{}'", server.entity_id))
                        }
                    })
                    .collect()
            }
            Ok(Err(err)) => {
                debug!(kind = %kind, error = %err, "Whole batch failed");
                vec![SubmitOutcome::from(err); batch.len()]
            }
            Err(_) => {
                warn!(kind = %kind, timeout_ms = self.submit_timeout.as_millis() as u64, "Submit timed out");
                metrics::record_submit_timeout(kind);
                tally.timeouts += 1;
                let reason = format!("submit timed out after {:?}", self.submit_timeout);
                vec![SubmitOutcome::transient(reason); batch.len()]
            }
        };

        let mut synced = Vec::new();
        let mut deferred = Vec::new();
        // Entities with an earlier record of this batch going round again
        let mut retrying: HashSet<&str> = HashSet::new();
        for (record, outcome) in batch.iter().zip(outcomes) {
            metrics::record_submission(kind, outcome.label());
            let disposition = match outcome {
                SubmitOutcome::Success if retrying.contains(record.entity_id.as_str()) => {
                    // Must be resent after the earlier record, or the stale one lands last
                    deferred.push(record.id.clone());
                    None
                }
                SubmitOutcome::Success => {
                    synced.push(record.id.clone());
                    None
                }
                SubmitOutcome::Transient { reason, retry_after } => {
                    self.queue
                        .ack_failure(&record.id, Classification::Transient { reason, retry_after })
                        .await
                }
                SubmitOutcome::Permanent { reason } => {
                    self.queue.ack_failure(&record.id, Classification::Permanent { reason }).await
                }
                SubmitOutcome::Conflict(server) => {
                    tally.conflicts += 1;
                    let resolution = self.resolver.resolve(&ConflictContext::new(record, &server));
                    metrics::record_conflict(kind, resolution.action.as_str());
                    debug!(
                        id = %record.id,
                        entity_id = %record.entity_id,
                        action = %resolution.action,
                        reason = resolution.reason,
                        "Conflict resolved"
                    );
                    match resolution.action {
                        ConflictAction::Retry => self.queue.requeue_merged(&record.id, resolution.merged_payload).await,
                        ConflictAction::Discard => {
                            if self.queue.discard(&record.id).await {
                                tally.discarded += 1;
                            }
                            None
                        }
                        ConflictAction::Escalate => {
                            let reason = format!("conflict escalated: {}", resolution.reason);
                            self.queue
                                .escalate(&record.id, reason)
                                .await
                                .then_some(FailureDisposition::DeadLettered)
                        }
                    }
                }
            };

            match disposition {
                Some(FailureDisposition::Retrying { .. }) => {
                    tally.retried += 1;
                    retrying.insert(record.entity_id.as_str());
                }
                Some(FailureDisposition::DeadLettered) => tally.dead_lettered += 1,
                None => {}
            }
        }

        tally.synced = self.queue.ack_success(&synced).await;
        if !deferred.is_empty() {
            tally.deferred = self.queue.release(&deferred).await;
            debug!(kind = %kind, deferred = tally.deferred, "Requeued records behind a retried record of the same entity");
        }
        tally
    }
}
