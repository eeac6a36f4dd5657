// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncEngine`] owns the [`OfflineQueue`] and decides when and how its
//! contents reach the server:
//! - triggers from a periodic timer, offline→online edges, and callers
//! - at most one cycle at a time; extra triggers are coalesced
//! - kinds drained in priority order through a bounded worker pool
//! - conflicts handed to the [`ConflictResolver`]
//!
//! # Lifecycle
//!
//! ```text
//! new → start (recovery) → run (trigger loop) → shutdown (final flush)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleet_sync::{OperationKind, SyncConfig, SyncEngine};
//! use fleet_sync::network::WatchNetwork;
//! use fleet_sync::storage::memory::InMemoryPersistence;
//! # use fleet_sync::remote::{RemoteSubmitter, SubmitOutcome};
//! # use fleet_sync::{OperationRecord, SubmissionError};
//! # struct Api;
//! # #[async_trait::async_trait]
//! # impl RemoteSubmitter for Api {
//! #     async fn submit(&self, batch: &[OperationRecord]) -> Result<Vec<SubmitOutcome>, SubmissionError> {
//! #         Ok(vec![SubmitOutcome::Success; batch.len()])
//! #     }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let network = Arc::new(WatchNetwork::new(false));
//! let engine = Arc::new(SyncEngine::new(
//!     SyncConfig::default(),
//!     Arc::new(InMemoryPersistence::new()),
//!     Arc::new(Api),
//!     network.clone(),
//! ));
//! engine.start().await.expect("recovery failed");
//! tokio::spawn(engine.clone().run());
//!
//! engine.enqueue(OperationKind::DeliveryStatus, "delivery-1", b"{\"status\":\"COMPLETED\"}".to_vec())
//!     .await
//!     .unwrap();
//!
//! // Coming online triggers a cycle
//! network.set_online(true);
//! engine.shutdown().await;
//! # }
//! ```

mod cycle;
mod entity_gate;
mod lifecycle;
mod types;

pub use types::{CompletionCallback, CycleEnd, CycleOutcome, CycleReport, SyncState, TriggerSource};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::network::NetworkStateSource;
use crate::operation::{OperationKind, OperationRecord};
use crate::queue::{EnqueueOutcome, OfflineQueue, QueuePressure};
use crate::remote::RemoteSubmitter;
use crate::resolver::ConflictResolver;
use crate::storage::PersistenceAdapter;

/// Offline-first sync engine.
///
/// # Thread Safety
///
/// `Send + Sync`; share it behind an `Arc`. Enqueueing is safe while a cycle
/// runs: new records land in the queue and are picked up by a later dequeue.
pub struct SyncEngine {
    pub(super) config: SyncConfig,
    pub(super) queue: Arc<OfflineQueue>,
    pub(super) submitter: Arc<dyn RemoteSubmitter>,
    pub(super) network: Arc<dyn NetworkStateSource>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) resolver: ConflictResolver,

    /// Single authority on whether a cycle is running
    pub(super) state: watch::Sender<SyncState>,

    /// Set by `cancel_cycle`, cleared when a cycle starts
    pub(super) cancel: AtomicBool,

    /// Stops the run loop
    pub(super) shutdown: watch::Sender<bool>,

    on_complete: Mutex<Option<CompletionCallback>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        persistence: Arc<dyn PersistenceAdapter>,
        submitter: Arc<dyn RemoteSubmitter>,
        network: Arc<dyn NetworkStateSource>,
    ) -> Self {
        Self::with_clock(config, persistence, submitter, network, Arc::new(SystemClock::new()))
    }

    /// Like [`new`](Self::new) with an injected clock for record timestamps.
    pub fn with_clock(
        config: SyncConfig,
        persistence: Arc<dyn PersistenceAdapter>,
        submitter: Arc<dyn RemoteSubmitter>,
        network: Arc<dyn NetworkStateSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Arc::new(OfflineQueue::new(config.clone(), persistence, clock.clone()));
        let (state, _) = watch::channel(SyncState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            queue,
            submitter,
            network,
            clock,
            resolver: ConflictResolver::new(),
            state,
            cancel: AtomicBool::new(false),
            shutdown,
            on_complete: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Enqueue a mutation stamped with the engine clock.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<EnqueueOutcome, SyncError> {
        let created_at = self.clock.now_millis();
        self.queue.enqueue(kind, entity_id, payload, created_at).await
    }

    /// Enqueue with an explicit creation time (epoch millis).
    pub async fn enqueue_at(
        &self,
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
        created_at: i64,
    ) -> Result<EnqueueOutcome, SyncError> {
        self.queue.enqueue(kind, entity_id, payload, created_at).await
    }

    /// Records of `kind` not yet synced or dead-lettered.
    pub async fn queue_depth(&self, kind: OperationKind) -> usize {
        self.queue.size(kind).await
    }

    pub async fn queue_pressure(&self, kind: OperationKind) -> QueuePressure {
        self.queue.pressure(kind).await
    }

    pub async fn dead_letter_entries(&self) -> Vec<OperationRecord> {
        self.queue.dead_letter_entries().await
    }

    /// Register a callback for every cycle that runs (including aborted ones).
    pub fn on_cycle_complete(&self, callback: impl Fn(&CycleReport) + Send + Sync + 'static) {
        *self.on_complete.lock() = Some(Arc::new(callback));
    }

    /// Stop the running cycle after its in-flight submissions finish.
    ///
    /// No effect when no cycle is running.
    pub fn cancel_cycle(&self) {
        if self.state().is_running() {
            info!("Sync cycle cancellation requested");
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Start a cycle on a new task. `false` when it was coalesced into a
    /// running one.
    pub fn trigger_sync(self: &Arc<Self>) -> bool {
        self.spawn_cycle(TriggerSource::Manual)
    }

    /// Run a cycle on the caller's task and return its outcome.
    pub async fn sync_now(&self) -> CycleOutcome {
        if !self.try_begin() {
            crate::metrics::record_coalesced_trigger(TriggerSource::Manual.as_str());
            return CycleOutcome::Coalesced;
        }
        self.execute_cycle(TriggerSource::Manual).await
    }

    fn spawn_cycle(self: &Arc<Self>, source: TriggerSource) -> bool {
        if !self.try_begin() {
            crate::metrics::record_coalesced_trigger(source.as_str());
            return false;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.execute_cycle(source).await;
        });
        true
    }

    pub(super) fn notify_completion(&self, report: &CycleReport) {
        // Clone out so the callback runs without the slot locked
        let callback = self.on_complete.lock().clone();
        if let Some(callback) = callback {
            debug!("Invoking cycle completion callback");
            callback(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SubmissionError;
    use crate::network::WatchNetwork;
    use crate::remote::SubmitOutcome;
    use crate::storage::memory::InMemoryPersistence;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct AcceptAll {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSubmitter for AcceptAll {
        async fn submit(&self, batch: &[OperationRecord]) -> Result<Vec<SubmitOutcome>, SubmissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SubmitOutcome::Success; batch.len()])
        }
    }

    /// Blocks every submit until released.
    struct Gated {
        release: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl RemoteSubmitter for Gated {
        async fn submit(&self, batch: &[OperationRecord]) -> Result<Vec<SubmitOutcome>, SubmissionError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![SubmitOutcome::Success; batch.len()])
        }
    }

    fn engine_with(submitter: Arc<dyn RemoteSubmitter>, online: bool) -> (Arc<SyncEngine>, Arc<WatchNetwork>) {
        let network = Arc::new(WatchNetwork::new(online));
        let engine = SyncEngine::with_clock(
            SyncConfig::default(),
            Arc::new(InMemoryPersistence::new()),
            submitter,
            network.clone(),
            Arc::new(ManualClock::new(1_000)),
        );
        (Arc::new(engine), network)
    }

    #[tokio::test]
    async fn test_new_engine_is_idle() {
        let (engine, _) = engine_with(Arc::new(AcceptAll { calls: AtomicUsize::new(0) }), true);
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(engine.queue_depth(OperationKind::DeliveryStatus).await, 0);
    }

    #[tokio::test]
    async fn test_sync_now_drains_queue() {
        let submitter = Arc::new(AcceptAll { calls: AtomicUsize::new(0) });
        let (engine, _) = engine_with(submitter.clone(), true);
        engine.start().await.unwrap();

        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();
        engine.enqueue(OperationKind::RouteState, "r-1", b"{}".to_vec()).await.unwrap();

        let outcome = engine.sync_now().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.end, CycleEnd::Drained);
        assert_eq!(engine.state(), SyncState::Completed);
        assert_eq!(engine.queue_depth(OperationKind::DeliveryStatus).await, 0);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_cycle_aborts() {
        let submitter = Arc::new(AcceptAll { calls: AtomicUsize::new(0) });
        let (engine, _) = engine_with(submitter.clone(), false);
        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();

        let outcome = engine.sync_now().await;
        assert!(matches!(outcome, CycleOutcome::Aborted(ref r) if r.end == CycleEnd::Offline));
        assert_eq!(engine.state(), SyncState::Aborted);
        assert_eq!(engine.queue_depth(OperationKind::DeliveryStatus).await, 1);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trigger_while_running_is_coalesced() {
        let submitter = Arc::new(Gated { release: Notify::new(), entered: Notify::new() });
        let (engine, _) = engine_with(submitter.clone(), true);
        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();

        assert!(engine.trigger_sync());
        submitter.entered.notified().await;
        assert!(engine.state().is_running());

        assert!(!engine.trigger_sync());
        assert!(engine.sync_now().await.is_coalesced());

        submitter.release.notify_one();
        let mut rx = engine.state_receiver();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.state(), SyncState::Completed);
    }

    #[tokio::test]
    async fn test_completion_callback_receives_report() {
        let (engine, _) = engine_with(Arc::new(AcceptAll { calls: AtomicUsize::new(0) }), true);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        engine.on_cycle_complete(move |report| {
            seen_cb.fetch_add(report.synced + 1, Ordering::SeqCst);
        });

        engine.enqueue(OperationKind::RouteState, "r-1", b"{}".to_vec()).await.unwrap();
        engine.sync_now().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let (engine, _) = engine_with(Arc::new(AcceptAll { calls: AtomicUsize::new(0) }), true);
        engine.cancel_cycle();
        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();
        let outcome = engine.sync_now().await;
        assert_eq!(outcome.report().unwrap().end, CycleEnd::Drained);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_when_online() {
        let (engine, _) = engine_with(Arc::new(AcceptAll { calls: AtomicUsize::new(0) }), true);
        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();

        let outcome = engine.shutdown().await.expect("flush should run");
        assert_eq!(outcome.report().unwrap().trigger, TriggerSource::Shutdown);
        assert_eq!(engine.queue_depth(OperationKind::DeliveryStatus).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_skips_flush_when_offline() {
        let (engine, _) = engine_with(Arc::new(AcceptAll { calls: AtomicUsize::new(0) }), false);
        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();
        assert!(engine.shutdown().await.is_none());
        assert_eq!(engine.queue_depth(OperationKind::DeliveryStatus).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_syncs_on_reconnect() {
        let submitter = Arc::new(AcceptAll { calls: AtomicUsize::new(0) });
        let (engine, network) = engine_with(submitter.clone(), false);
        engine.enqueue(OperationKind::DeliveryStatus, "d-1", b"{}".to_vec()).await.unwrap();

        let handle = tokio::spawn(engine.clone().run());
        tokio::task::yield_now().await;

        network.set_online(true);
        let mut rx = engine.state_receiver();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == SyncState::Completed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);

        engine.shutdown().await;
        handle.await.unwrap();
    }
}
