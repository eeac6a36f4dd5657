// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{PersistenceAdapter, StorageError};
use crate::operation::{OperationKind, OperationRecord, RecordId, RecordStatus};

/// Process-local persistence. Survives engine restarts within one process,
/// which is what the recovery tests rely on.
pub struct InMemoryPersistence {
    records: DashMap<RecordId, OperationRecord>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Stored record count, dead letter included
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of a stored record
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<OperationRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    fn collect<F>(&self, keep: F) -> Vec<OperationRecord>
    where
        F: Fn(&OperationRecord) -> bool,
    {
        let mut out: Vec<OperationRecord> = self
            .records
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.created_at, r.seq));
        out
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn save(&self, record: &OperationRecord) -> Result<(), StorageError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StorageError> {
        self.records.remove(id);
        Ok(())
    }

    async fn load_pending(&self, kind: OperationKind) -> Result<Vec<OperationRecord>, StorageError> {
        Ok(self.collect(|r| r.kind == kind && r.status != RecordStatus::FailedPermanent))
    }

    async fn load_dead_letter(&self) -> Result<Vec<OperationRecord>, StorageError> {
        let mut out = self.collect(|r| r.status == RecordStatus::FailedPermanent);
        out.sort_by_key(|r| r.seq);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: OperationKind, entity: &str, created_at: i64) -> OperationRecord {
        OperationRecord::new(kind, entity, b"{}".to_vec(), created_at)
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryPersistence::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = InMemoryPersistence::new();
        let mut r = record(OperationKind::DeliveryStatus, "d-1", 10);
        store.save(&r).await.unwrap();

        r.attempts = 2;
        r.status = RecordStatus::Submitting;
        store.save(&r).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get(&r.id).unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.status, RecordStatus::Submitting);
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = InMemoryPersistence::new();
        assert!(store.delete(&RecordId::from("missing")).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_pending_filters_kind_and_dead_letter() {
        let store = InMemoryPersistence::new();
        let a = record(OperationKind::DeliveryStatus, "d-1", 30);
        let b = record(OperationKind::DeliveryStatus, "d-2", 10);
        let mut dead = record(OperationKind::DeliveryStatus, "d-3", 20);
        dead.status = RecordStatus::FailedPermanent;
        let other = record(OperationKind::LocationUpdate, "v-1", 5);

        store.save_batch(&[a.clone(), b.clone(), dead.clone(), other]).await.unwrap();

        let pending = store.load_pending(OperationKind::DeliveryStatus).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        let dl = store.load_dead_letter().await.unwrap();
        assert_eq!(dl.len(), 1);
        assert_eq!(dl[0].id, dead.id);
    }

    #[tokio::test]
    async fn test_dead_letter_ordered_by_seq() {
        let store = InMemoryPersistence::new();
        let mut early = record(OperationKind::RouteState, "r-1", 10);
        early.status = RecordStatus::FailedPermanent;
        early.seq = 5;
        let mut late = record(OperationKind::RouteState, "r-2", 90);
        late.status = RecordStatus::FailedPermanent;
        late.seq = 2;
        store.save_batch(&[early.clone(), late.clone()]).await.unwrap();

        let dl = store.load_dead_letter().await.unwrap();
        assert_eq!(dl[0].id, late.id);
        assert_eq!(dl[1].id, early.id);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryPersistence::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let r = record(OperationKind::LocationUpdate, &format!("v-{batch}"), i);
                    store_clone.save(&r).await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
