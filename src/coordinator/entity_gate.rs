// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity mutual exclusion for one sync cycle.
//!
//! A batch holds the locks of every entity it touches until its submission
//! has been acknowledged, so two batches for the same delivery are never on
//! the wire together. The dispatcher never waits on the gate: a batch that
//! cannot take every lock at once is handed back.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::operation::OperationRecord;

#[derive(Default)]
pub(super) struct EntityGate {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the lifetime of one in-flight batch.
pub(super) struct EntityPass {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl EntityGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, entity_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Lock every entity of `batch`, or none if another in-flight batch
    /// holds any of them.
    pub fn try_acquire(&self, batch: &[OperationRecord]) -> Option<EntityPass> {
        let entities: BTreeSet<&str> = batch.iter().map(|r| r.entity_id.as_str()).collect();
        let mut guards = Vec::with_capacity(entities.len());
        for entity in entities {
            guards.push(self.lock_for(entity).try_lock_owned().ok()?);
        }
        Some(EntityPass { _guards: guards })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    fn batch(entities: &[&str]) -> Vec<OperationRecord> {
        entities
            .iter()
            .map(|e| OperationRecord::new(OperationKind::DeliveryStatus, *e, b"{}".to_vec(), 0))
            .collect()
    }

    #[test]
    fn test_disjoint_batches_both_pass() {
        let gate = EntityGate::new();
        let _a = gate.try_acquire(&batch(&["d-1", "d-2"])).unwrap();
        assert!(gate.try_acquire(&batch(&["d-3"])).is_some());
    }

    #[test]
    fn test_overlapping_batch_refused_until_release() {
        let gate = EntityGate::new();
        let first = gate.try_acquire(&batch(&["d-1", "d-2"])).unwrap();
        assert!(gate.try_acquire(&batch(&["d-2", "d-9"])).is_none());

        // A refused batch keeps none of its locks
        assert!(gate.try_acquire(&batch(&["d-9"])).is_some());

        drop(first);
        assert!(gate.try_acquire(&batch(&["d-2", "d-1"])).is_some());
    }

    #[test]
    fn test_duplicate_entities_in_one_batch() {
        let gate = EntityGate::new();
        assert!(gate.try_acquire(&batch(&["v-1", "v-1"])).is_some());
    }
}
