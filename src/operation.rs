// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation record data structure.
//!
//! The [`OperationRecord`] is the unit of work that flows through the offline
//! queue. Each record carries an opaque payload, the entity it mutates, and the
//! bookkeeping the orchestrator needs to retry it safely.
//!
//! # Example
//!
//! ```
//! use fleet_sync::{OperationKind, OperationRecord, RecordStatus};
//!
//! let record = OperationRecord::new(
//!     OperationKind::DeliveryStatus,
//!     "delivery-42",
//!     br#"{"delivery_id":"delivery-42","status":"IN_PROGRESS"}"#.to_vec(),
//!     1_700_000_000_000,
//! );
//!
//! assert_eq!(record.status, RecordStatus::Pending);
//! assert_eq!(record.attempts, 0);
//! assert!(record.priority() > OperationKind::LocationUpdate.priority());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Unique, immutable identifier assigned to a record at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of mutation. Priority is declarative metadata on the kind, so the
/// scheduling order never depends on call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    LocationUpdate,
    DeliveryStatus,
    ProofOfDelivery,
    RouteState,
}

impl OperationKind {
    /// All kinds, highest priority first. This is the order a sync cycle drains them in.
    pub const BY_PRIORITY: [OperationKind; 4] = [
        OperationKind::ProofOfDelivery,
        OperationKind::DeliveryStatus,
        OperationKind::RouteState,
        OperationKind::LocationUpdate,
    ];

    /// Numeric priority, higher is more important.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::ProofOfDelivery => 3,
            Self::DeliveryStatus => 2,
            Self::RouteState => 1,
            Self::LocationUpdate => 0,
        }
    }

    /// Wire/storage name (`LOCATION_UPDATE`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocationUpdate => "LOCATION_UPDATE",
            Self::DeliveryStatus => "DELIVERY_STATUS",
            Self::ProofOfDelivery => "PROOF_OF_DELIVERY",
            Self::RouteState => "ROUTE_STATE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCATION_UPDATE" => Ok(Self::LocationUpdate),
            "DELIVERY_STATUS" => Ok(Self::DeliveryStatus),
            "PROOF_OF_DELIVERY" => Ok(Self::ProofOfDelivery),
            "ROUTE_STATE" => Ok(Self::RouteState),
            other => Err(SyncError::InvalidOperation(format!("unknown operation kind '{other}'"))),
        }
    }
}

/// Lifecycle of a record.
///
/// ```text
/// Pending → Submitting → { Synced | FailedTransient | FailedPermanent }
///              FailedTransient → Pending (with not_before)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Submitting,
    Synced,
    FailedTransient,
    FailedPermanent,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitting => "SUBMITTING",
            Self::Synced => "SYNCED",
            Self::FailedTransient => "FAILED_TRANSIENT",
            Self::FailedPermanent => "FAILED_PERMANENT",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUBMITTING" => Ok(Self::Submitting),
            "SYNCED" => Ok(Self::Synced),
            "FAILED_TRANSIENT" => Ok(Self::FailedTransient),
            "FAILED_PERMANENT" => Ok(Self::FailedPermanent),
            other => Err(SyncError::InvalidOperation(format!("unknown record status '{other}'"))),
        }
    }
}

/// Failure classification recorded on a record for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Conflict,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// Last failure seen for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub class: FailureClass,
    pub message: String,
}

impl LastError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }
}

/// A single queued mutation awaiting transmission to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: RecordId,
    pub kind: OperationKind,
    /// Vehicle, delivery or route the mutation applies to
    pub entity_id: String,
    /// Opaque serialized mutation
    pub payload: Vec<u8>,
    /// Client timestamp (epoch millis)
    pub created_at: i64,
    pub attempts: u32,
    pub status: RecordStatus,
    /// Earliest time (epoch millis) the record may be submitted again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Monotonic sequence. Breaks `created_at` ties in enqueue order while the
    /// record is live; reassigned when it enters the dead letter.
    #[serde(default)]
    pub seq: u64,
}

impl OperationRecord {
    /// Create a fresh `Pending` record with a newly generated id.
    pub fn new(
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
        created_at: i64,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            kind,
            entity_id: entity_id.into(),
            payload,
            created_at,
            attempts: 0,
            status: RecordStatus::Pending,
            not_before: None,
            last_error: None,
            seq: 0,
        }
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }

    /// Whether the record may be handed to a submitter at `now_ms`.
    #[must_use]
    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.status == RecordStatus::Pending && self.not_before.map_or(true, |t| t <= now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: OperationKind) -> OperationRecord {
        OperationRecord::new(kind, "entity-1", b"{}".to_vec(), 1_000)
    }

    #[test]
    fn test_new_record_defaults() {
        let r = record(OperationKind::LocationUpdate);
        assert_eq!(r.status, RecordStatus::Pending);
        assert_eq!(r.attempts, 0);
        assert!(r.not_before.is_none());
        assert!(r.last_error.is_none());
        assert!(!r.id.as_str().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = record(OperationKind::RouteState);
        let b = record(OperationKind::RouteState);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_priority_order() {
        let p: Vec<u8> = OperationKind::BY_PRIORITY.iter().map(|k| k.priority()).collect();
        assert_eq!(p, vec![3, 2, 1, 0]);
        assert!(OperationKind::ProofOfDelivery.priority() > OperationKind::DeliveryStatus.priority());
        assert!(OperationKind::RouteState.priority() > OperationKind::LocationUpdate.priority());
    }

    #[test]
    fn test_kind_parse_roundtrip_and_unknown() {
        for kind in OperationKind::BY_PRIORITY {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        let err = "TELEMETRY".parse::<OperationKind>().unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }

    #[test]
    fn test_kind_serde_name() {
        let json = serde_json::to_string(&OperationKind::ProofOfDelivery).unwrap();
        assert_eq!(json, "\"PROOF_OF_DELIVERY\"");
    }

    #[test]
    fn test_is_ready_respects_not_before() {
        let mut r = record(OperationKind::DeliveryStatus);
        assert!(r.is_ready(0));

        r.not_before = Some(5_000);
        assert!(!r.is_ready(4_999));
        assert!(r.is_ready(5_000));

        r.status = RecordStatus::Submitting;
        assert!(!r.is_ready(10_000));
    }

    #[test]
    fn test_serialize_skips_empty_optionals() {
        let r = record(OperationKind::LocationUpdate);
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("not_before"));
        assert!(!json.contains("last_error"));

        let back: OperationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
