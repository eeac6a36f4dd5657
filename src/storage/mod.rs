// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence backends for the offline queue.
//!
//! - [`memory::InMemoryPersistence`]: DashMap, for tests and ephemeral hosts
//! - [`sql::SqlitePersistence`]: on-device SQLite through the sqlx `Any` driver

pub mod memory;
pub mod sql;
pub mod traits;

pub use traits::{PersistenceAdapter, StorageError};
