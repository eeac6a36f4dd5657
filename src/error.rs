// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! Only [`SyncError`] ever reaches callers of the engine. Submission errors are
//! consumed by the orchestrator and surface as dead-letter entries or queue depth.

use std::time::Duration;

use thiserror::Error;

use crate::operation::OperationKind;
use crate::remote::ServerState;
use crate::storage::StorageError;

/// Errors returned synchronously from enqueue and lifecycle calls.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed enqueue request. Never queued.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Queue is full for a kind with nothing evictable. Backpressure signal.
    #[error("queue capacity exceeded for {kind} (limit {limit})")]
    CapacityExceeded { kind: OperationKind, limit: usize },

    #[error("persistence error: {0}")]
    Storage(#[from] StorageError),
}

/// Classified failure of a remote submission.
#[derive(Error, Debug, Clone)]
pub enum SubmissionError {
    /// Timeout, 5xx, rate limiting, connection loss.
    #[error("transient submission failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Validation rejected or malformed payload. Not retried.
    #[error("permanent submission failure: {reason}")]
    Permanent { reason: String },

    /// Server holds a different version of the entity.
    #[error("conflict with server state modified at {}", .0.last_modified)]
    Conflict(ServerState),
}

impl SubmissionError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient { reason: reason.into(), retry_after: None }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent { reason: reason.into() }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_display() {
        let err = SyncError::CapacityExceeded { kind: OperationKind::ProofOfDelivery, limit: 50 };
        assert_eq!(err.to_string(), "queue capacity exceeded for PROOF_OF_DELIVERY (limit 50)");
    }

    #[test]
    fn test_storage_error_converts() {
        let err: SyncError = StorageError::Backend("disk full".into()).into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_submission_error_helpers() {
        assert!(SubmissionError::transient("timeout").is_transient());
        assert!(!SubmissionError::permanent("400 bad request").is_transient());
    }
}
