// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed payloads for the four operation kinds.
//!
//! The queue treats payloads as opaque bytes. These helpers give domain
//! callers a canonical JSON encoding, and give the conflict resolver a way to
//! read delivery and route statuses out of a queued record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Status of a delivery or route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl EntityStatus {
    /// Terminal statuses outrank intermediate ones regardless of timestamps.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Serialize a typed payload to bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(value)
        .map_err(|e| SyncError::InvalidOperation(format!("payload encoding failed: {e}")))
}

/// Decode a typed payload, `None` when the bytes are not this shape.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    serde_json::from_slice(bytes).ok()
}

/// GPS sample captured by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, accuracy: 0.0, speed: None, bearing: None, altitude: None }
    }

    /// Reject samples without usable coordinates.
    pub fn validate(&self) -> Result<(), SyncError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SyncError::InvalidOperation(format!("latitude out of range: {}", self.latitude)));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SyncError::InvalidOperation(format!("longitude out of range: {}", self.longitude)));
        }
        Ok(())
    }

    /// Validate and encode.
    pub fn to_payload(&self) -> Result<Vec<u8>, SyncError> {
        self.validate()?;
        encode(self)
    }
}

/// Delivery status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusUpdate {
    pub delivery_id: String,
    pub status: EntityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl DeliveryStatusUpdate {
    pub fn new(delivery_id: impl Into<String>, status: EntityStatus) -> Self {
        Self { delivery_id: delivery_id.into(), status, note: None }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, SyncError> {
        encode(self)
    }
}

/// Proof-of-delivery evidence. Never silently discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfDelivery {
    pub delivery_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub photo_refs: Vec<String>,
}

impl ProofOfDelivery {
    pub fn to_payload(&self) -> Result<Vec<u8>, SyncError> {
        if self.signature.is_none() && self.photo_refs.is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "proof of delivery for {} carries no signature or photo",
                self.delivery_id
            )));
        }
        encode(self)
    }
}

/// Route status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStateUpdate {
    pub route_id: String,
    pub status: EntityStatus,
}

impl RouteStateUpdate {
    pub fn new(route_id: impl Into<String>, status: EntityStatus) -> Self {
        Self { route_id: route_id.into(), status }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, SyncError> {
        encode(self)
    }
}

/// Read the `status` field of a delivery or route payload.
pub fn status_of(bytes: &[u8]) -> Option<EntityStatus> {
    #[derive(Deserialize)]
    struct StatusOnly {
        status: EntityStatus,
    }
    decode::<StatusOnly>(bytes).map(|s| s.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(EntityStatus::Completed.is_terminal());
        assert!(EntityStatus::Failed.is_terminal());
        assert!(!EntityStatus::InProgress.is_terminal());
        assert!(!EntityStatus::Pending.is_terminal());
    }

    #[test]
    fn test_location_validation() {
        assert!(LocationSample::new(51.5, -0.12).to_payload().is_ok());
        assert!(LocationSample::new(91.0, 0.0).to_payload().is_err());
        assert!(LocationSample::new(0.0, f64::NAN).to_payload().is_err());
    }

    #[test]
    fn test_status_of_reads_delivery_and_route_payloads() {
        let delivery = DeliveryStatusUpdate::new("d-1", EntityStatus::InProgress).to_payload().unwrap();
        assert_eq!(status_of(&delivery), Some(EntityStatus::InProgress));

        let route = RouteStateUpdate::new("r-1", EntityStatus::Completed).to_payload().unwrap();
        assert_eq!(status_of(&route), Some(EntityStatus::Completed));

        assert_eq!(status_of(b"not json"), None);
    }

    #[test]
    fn test_status_wire_name() {
        let bytes = DeliveryStatusUpdate::new("d-1", EntityStatus::InProgress).to_payload().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"IN_PROGRESS\""));
    }

    #[test]
    fn test_proof_requires_evidence() {
        let empty = ProofOfDelivery {
            delivery_id: "d-1".into(),
            recipient: Some("J. Smith".into()),
            signature: None,
            photo_refs: vec![],
        };
        assert!(empty.to_payload().is_err());

        let signed = ProofOfDelivery { signature: Some("sig-bytes".into()), ..empty };
        assert!(signed.to_payload().is_ok());
    }
}
