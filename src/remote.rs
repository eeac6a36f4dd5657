// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote submitter contract.
//!
//! The concrete transport (HTTP, WebSocket) lives outside this crate. A
//! submitter performs one network exchange per batch and reports one
//! [`SubmitOutcome`] per record, in batch order.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubmissionError;
use crate::operation::OperationRecord;
use crate::payload::EntityStatus;

/// Server's current view of an entity, returned alongside a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub entity_id: String,
    /// Server modification time (epoch millis)
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Delivery or route status, when the entity has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    /// Whether the delivery already carries proof of delivery
    #[serde(default)]
    pub has_proof: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl ServerState {
    pub fn new(entity_id: impl Into<String>, last_modified: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            last_modified,
            version: None,
            status: None,
            has_proof: false,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn with_proof(mut self) -> Self {
        self.has_proof = true;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Result of submitting a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Success,
    Conflict(ServerState),
    Transient {
        reason: String,
        /// Server supplied `Retry-After`
        retry_after: Option<Duration>,
    },
    Permanent { reason: String },
}

impl SubmitOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient { reason: reason.into(), retry_after: None }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent { reason: reason.into() }
    }

    /// Label used for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Conflict(_) => "conflict",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
        }
    }
}

impl From<SubmissionError> for SubmitOutcome {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::Transient { reason, retry_after } => Self::Transient { reason, retry_after },
            SubmissionError::Permanent { reason } => Self::Permanent { reason },
            SubmissionError::Conflict(state) => Self::Conflict(state),
        }
    }
}

/// Performs one network exchange per batch.
///
/// `Ok` must contain one outcome per record, in the order of `batch`. A
/// whole-batch `Err` (connection refused, 503 for the entire request) is
/// applied to every record of the batch. A whole-batch conflict only reaches
/// the resolver for records of the conflicting entity; the rest are retried.
#[async_trait]
pub trait RemoteSubmitter: Send + Sync {
    async fn submit(&self, batch: &[OperationRecord]) -> Result<Vec<SubmitOutcome>, SubmissionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_error_maps_to_outcome() {
        let outcome: SubmitOutcome = SubmissionError::Transient {
            reason: "429".into(),
            retry_after: Some(Duration::from_secs(120)),
        }
        .into();
        assert_eq!(
            outcome,
            SubmitOutcome::Transient { reason: "429".into(), retry_after: Some(Duration::from_secs(120)) }
        );

        let outcome: SubmitOutcome = SubmissionError::permanent("422").into();
        assert_eq!(outcome.label(), "permanent");
    }

    #[test]
    fn test_server_state_builder() {
        let state = ServerState::new("delivery-1", 500)
            .with_status(EntityStatus::Completed)
            .with_version(7)
            .with_proof();
        assert_eq!(state.status, Some(EntityStatus::Completed));
        assert_eq!(state.version, Some(7));
        assert!(state.has_proof);
        assert!(state.payload.is_none());
    }
}
