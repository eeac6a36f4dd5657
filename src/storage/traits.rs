// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::operation::{OperationKind, OperationRecord, RecordId};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },
}

/// Durable home of queued operation records.
///
/// `save` is an upsert keyed by record id. Dead-lettered records stay in the
/// store with status `FAILED_PERMANENT` until the dead-letter log drops them.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn save(&self, record: &OperationRecord) -> Result<(), StorageError>;

    /// Deleting an unknown id is not an error.
    async fn delete(&self, id: &RecordId) -> Result<(), StorageError>;

    /// Every record of `kind` that is not dead-lettered, in any status.
    async fn load_pending(&self, kind: OperationKind) -> Result<Vec<OperationRecord>, StorageError>;

    /// Records with status `FAILED_PERMANENT`, in the order they were dead-lettered (`seq`).
    async fn load_dead_letter(&self) -> Result<Vec<OperationRecord>, StorageError>;

    /// Save several records. Default implementation falls back to sequential saves.
    async fn save_batch(&self, records: &[OperationRecord]) -> Result<(), StorageError> {
        for record in records {
            self.save(record).await?;
        }
        Ok(())
    }
}
