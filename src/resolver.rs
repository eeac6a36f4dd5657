// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict resolution.
//!
//! Deterministic and side-effect free: the same local record and server
//! state always produce the same [`Resolution`]. The orchestrator applies it.
//!
//! | Kind | Rule |
//! |------|------|
//! | `PROOF_OF_DELIVERY` | server already has proof → escalate, else retry |
//! | `DELIVERY_STATUS`, `ROUTE_STATE` | terminal status outranks non-terminal, then last-write-wins |
//! | `LOCATION_UPDATE` | last-write-wins |
//!
//! # Example
//!
//! ```
//! use fleet_sync::{ConflictAction, ConflictContext, ConflictResolver, OperationKind, OperationRecord};
//! use fleet_sync::payload::{DeliveryStatusUpdate, EntityStatus};
//! use fleet_sync::remote::ServerState;
//!
//! let local = OperationRecord::new(
//!     OperationKind::DeliveryStatus,
//!     "delivery-9",
//!     DeliveryStatusUpdate::new("delivery-9", EntityStatus::InProgress).to_payload().unwrap(),
//!     2_000,
//! );
//! // Server says COMPLETED, older timestamp: terminal still wins
//! let server = ServerState::new("delivery-9", 1_000).with_status(EntityStatus::Completed);
//!
//! let resolution = ConflictResolver::new().resolve(&ConflictContext::new(&local, &server));
//! assert_eq!(resolution.action, ConflictAction::Discard);
//! ```

use serde_json::{Map, Value};

use crate::operation::{OperationKind, OperationRecord};
use crate::payload::{self, EntityStatus};
use crate::remote::ServerState;

/// A local record paired with the server's view of the same entity.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub local: &'a OperationRecord,
    pub server: &'a ServerState,
}

impl<'a> ConflictContext<'a> {
    pub fn new(local: &'a OperationRecord, server: &'a ServerState) -> Self {
        Self { local, server }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Resubmit, with the merged payload when there is one
    Retry,
    /// Server state stands; drop the local record
    Discard,
    /// Needs a human; local record goes to the dead letter
    Escalate,
}

impl ConflictAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Discard => "discard",
            Self::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub action: ConflictAction,
    /// Replacement payload for a retry. `None` keeps the local payload.
    pub merged_payload: Option<Vec<u8>>,
    /// Which rule decided, for logs and dead-letter messages
    pub reason: &'static str,
}

impl Resolution {
    fn discard(reason: &'static str) -> Self {
        Self { action: ConflictAction::Discard, merged_payload: None, reason }
    }

    fn escalate(reason: &'static str) -> Self {
        Self { action: ConflictAction::Escalate, merged_payload: None, reason }
    }

    fn retry(ctx: &ConflictContext<'_>, reason: &'static str) -> Self {
        Self {
            action: ConflictAction::Retry,
            merged_payload: merge_payload(ctx.local, ctx.server),
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        match ctx.local.kind {
            OperationKind::ProofOfDelivery => {
                if ctx.server.has_proof {
                    Resolution::escalate("server already holds proof of delivery")
                } else {
                    Resolution::retry(ctx, "proof of delivery is never dropped")
                }
            }
            OperationKind::DeliveryStatus | OperationKind::RouteState => {
                let local = payload::status_of(&ctx.local.payload);
                resolve_status(ctx, local, ctx.server.status)
            }
            OperationKind::LocationUpdate => last_write_wins(ctx),
        }
    }
}

fn is_terminal(status: Option<EntityStatus>) -> bool {
    status.is_some_and(EntityStatus::is_terminal)
}

fn resolve_status(
    ctx: &ConflictContext<'_>,
    local: Option<EntityStatus>,
    server: Option<EntityStatus>,
) -> Resolution {
    match (is_terminal(local), is_terminal(server)) {
        (false, true) => Resolution::discard("server holds a terminal status"),
        (true, false) => Resolution::retry(ctx, "local terminal status outranks server"),
        (true, true) if local == server => Resolution::discard("both sides agree on terminal status"),
        (true, true) => Resolution::escalate("local and server disagree on terminal status"),
        (false, false) => last_write_wins(ctx),
    }
}

fn last_write_wins(ctx: &ConflictContext<'_>) -> Resolution {
    if ctx.local.created_at > ctx.server.last_modified {
        Resolution::retry(ctx, "local write is newer")
    } else {
        Resolution::discard("server write is newer or same age")
    }
}

/// Server object overlaid with local fields, plus `base_version` when the
/// server reports one. `None` when the local payload is not a JSON object or
/// nothing would change.
fn merge_payload(local: &OperationRecord, server: &ServerState) -> Option<Vec<u8>> {
    let Ok(Value::Object(local_fields)) = serde_json::from_slice::<Value>(&local.payload) else {
        return None;
    };

    let server_fields = server
        .payload
        .as_deref()
        .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        });

    if server_fields.is_none() && server.version.is_none() {
        return None;
    }

    let mut merged: Map<String, Value> = server_fields.unwrap_or_default();
    for (key, value) in local_fields {
        merged.insert(key, value);
    }
    if let Some(version) = server.version {
        merged.insert("base_version".into(), Value::from(version));
    }

    serde_json::to_vec(&Value::Object(merged)).ok()
}
