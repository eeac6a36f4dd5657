// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, run loop, shutdown.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::queue::RecoveryReport;

use super::types::{CycleOutcome, TriggerSource};
use super::SyncEngine;

impl SyncEngine {
    /// Restore the queue from persistence.
    ///
    /// Must complete before the first `enqueue`. Records left mid-submission
    /// by a crash go back to pending.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<RecoveryReport, SyncError> {
        let startup_start = Instant::now();
        info!("Starting sync engine...");

        let report = self.queue.recover().await?;

        info!(
            restored = report.restored,
            reset_in_flight = report.reset_in_flight,
            evicted = report.evicted,
            dead_letter = report.dead_letter,
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            "Sync engine started"
        );
        Ok(report)
    }

    /// Drive timer and network triggers until [`shutdown`](Self::shutdown).
    ///
    /// Cycles run on their own tasks, so a slow cycle never delays trigger
    /// handling; overlapping triggers are coalesced.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        let period = self.config.sync_interval();
        let mut timer = interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut network_rx = self.network.subscribe();
        let mut was_online = *network_rx.borrow_and_update();
        let mut network_alive = true;

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return;
        }

        info!(interval_secs = period.as_secs(), online = was_online, "Sync engine running");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.trigger(TriggerSource::Timer);
                }

                changed = network_rx.changed(), if network_alive => {
                    if changed.is_err() {
                        warn!("Network state source closed, connectivity triggers disabled");
                        network_alive = false;
                        continue;
                    }
                    let online = *network_rx.borrow_and_update();
                    if online && !was_online {
                        info!("Connectivity restored");
                        self.trigger(TriggerSource::Network);
                    } else if !online && was_online {
                        info!("Connectivity lost");
                    }
                    was_online = online;
                }

                _ = shutdown_rx.changed() => {
                    debug!("Run loop received shutdown");
                    break;
                }
            }
        }

        info!("Sync engine run loop stopped");
    }

    /// Stop the run loop, wait out any running cycle, then flush once if online.
    ///
    /// Returns the outcome of the final flush, if one ran.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Option<CycleOutcome> {
        let shutdown_start = Instant::now();
        info!("Initiating sync engine shutdown...");
        self.shutdown.send_replace(true);

        let mut state_rx = self.state.subscribe();
        if state_rx.wait_for(|s| !s.is_running()).await.is_err() {
            warn!("State channel closed during shutdown");
        }

        let outcome = if self.config.flush_on_shutdown && self.network.is_online() {
            if self.try_begin() {
                info!("Flushing queue before shutdown");
                Some(self.execute_cycle(TriggerSource::Shutdown).await)
            } else {
                // Someone claimed the slot between the wait and here
                Some(CycleOutcome::Coalesced)
            }
        } else {
            debug!(
                flush_on_shutdown = self.config.flush_on_shutdown,
                online = self.network.is_online(),
                "Skipping final flush"
            );
            None
        };

        info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "Sync engine shutdown complete");
        outcome
    }

    fn trigger(self: &Arc<Self>, source: TriggerSource) {
        if !self.spawn_cycle(source) {
            debug!(trigger = source.as_str(), "Trigger coalesced into running cycle");
        }
    }
}
