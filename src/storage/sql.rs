// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite persistence for the offline queue.
//!
//! One row per operation record:
//! ```sql
//! CREATE TABLE operations (
//!   id TEXT PRIMARY KEY,
//!   kind TEXT NOT NULL,        -- LOCATION_UPDATE, DELIVERY_STATUS, ...
//!   entity_id TEXT NOT NULL,
//!   payload BLOB NOT NULL,     -- opaque bytes
//!   created_at INTEGER NOT NULL,
//!   attempts INTEGER NOT NULL,
//!   status TEXT NOT NULL,      -- PENDING, SUBMITTING, FAILED_PERMANENT, ...
//!   not_before INTEGER,
//!   last_error TEXT,           -- {"class": "...", "message": "..."}
//!   seq INTEGER NOT NULL
//! )
//! ```
//!
//! Records left in `SUBMITTING` by a crash are loaded as-is; the queue resets
//! them to `PENDING` during recovery.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{PersistenceAdapter, StorageError};
use crate::operation::{LastError, OperationKind, OperationRecord, RecordId, RecordStatus};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SELECT_COLUMNS: &str =
    "SELECT id, kind, entity_id, payload, created_at, attempts, status, not_before, last_error, seq FROM operations";

pub struct SqlitePersistence {
    pool: AnyPool,
}

impl SqlitePersistence {
    /// Open (or create) the store at `connection_string`, e.g.
    /// `sqlite:///data/queue.db?mode=rwc`. Uses startup-mode retry.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        if !connection_string.starts_with("sqlite:") {
            return Err(StorageError::Backend(format!(
                "unsupported connection string '{connection_string}', expected sqlite:"
            )));
        }

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        debug!(url = connection_string, "SQLite persistence ready");
        Ok(store)
    }

    /// WAL lets the sync task read while enqueue writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                not_before INTEGER,
                last_error TEXT,
                seq INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_operations_kind_status ON operations (kind, status)",
        ];

        for sql in statements {
            retry("sqlite_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    /// Stored row count, dead letter included.
    pub async fn count_all(&self) -> Result<u64, StorageError> {
        retry("sqlite_count", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM operations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let n: i64 = row.try_get("n").map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(n as u64)
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn text(row: &AnyRow, column: &str) -> Option<String> {
        // Any driver may hand TEXT back as bytes
        row.try_get::<String, _>(column).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn row_to_record(row: &AnyRow) -> Result<OperationRecord, StorageError> {
        let id = Self::text(row, "id").ok_or_else(|| StorageError::Corrupt {
            id: "<unknown>".into(),
            reason: "missing id".into(),
        })?;
        let corrupt = |reason: String| StorageError::Corrupt { id: id.clone(), reason };

        let kind: OperationKind = Self::text(row, "kind")
            .ok_or_else(|| corrupt("missing kind".into()))?
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let status: RecordStatus = Self::text(row, "status")
            .ok_or_else(|| corrupt("missing status".into()))?
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let entity_id = Self::text(row, "entity_id").ok_or_else(|| corrupt("missing entity_id".into()))?;
        let payload: Vec<u8> = row
            .try_get("payload")
            .map_err(|e| corrupt(format!("payload: {e}")))?;
        let created_at: i64 = row
            .try_get("created_at")
            .map_err(|e| corrupt(format!("created_at: {e}")))?;
        let attempts: i64 = row.try_get("attempts").unwrap_or(0);
        let not_before: Option<i64> = row.try_get("not_before").ok().flatten();
        let seq: i64 = row.try_get("seq").unwrap_or(0);
        let last_error = match Self::text(row, "last_error") {
            Some(json) => Some(
                serde_json::from_str::<LastError>(&json)
                    .map_err(|e| corrupt(format!("last_error: {e}")))?,
            ),
            None => None,
        };

        Ok(OperationRecord {
            id: RecordId::from(id.clone()),
            kind,
            entity_id,
            payload,
            created_at,
            attempts: attempts.max(0) as u32,
            status,
            not_before,
            last_error,
            seq: seq.max(0) as u64,
        })
    }

    async fn fetch(&self, op: &str, sql: String, binds: Vec<String>) -> Result<Vec<OperationRecord>, StorageError> {
        let rows = retry(op, &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for b in &binds {
                query = query.bind(b.clone());
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
    async fn save(&self, record: &OperationRecord) -> Result<(), StorageError> {
        let last_error = match &record.last_error {
            Some(e) => Some(serde_json::to_string(e).map_err(|e| StorageError::Backend(e.to_string()))?),
            None => None,
        };

        let sql = "INSERT INTO operations (id, kind, entity_id, payload, created_at, attempts, status, not_before, last_error, seq)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                attempts = excluded.attempts,
                status = excluded.status,
                not_before = excluded.not_before,
                last_error = excluded.last_error";

        retry("sqlite_save", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(record.id.as_str())
                .bind(record.kind.as_str())
                .bind(&record.entity_id)
                .bind(&record.payload)
                .bind(record.created_at)
                .bind(i64::from(record.attempts))
                .bind(record.status.as_str())
                .bind(record.not_before)
                .bind(&last_error)
                .bind(record.seq as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StorageError> {
        retry("sqlite_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM operations WHERE id = ?")
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn load_pending(&self, kind: OperationKind) -> Result<Vec<OperationRecord>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE kind = ? AND status <> ? ORDER BY created_at, seq");
        self.fetch(
            "sqlite_load_pending",
            sql,
            vec![kind.as_str().to_string(), RecordStatus::FailedPermanent.as_str().to_string()],
        )
        .await
    }

    async fn load_dead_letter(&self) -> Result<Vec<OperationRecord>, StorageError> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY seq");
        self.fetch(
            "sqlite_load_dead_letter",
            sql,
            vec![RecordStatus::FailedPermanent.as_str().to_string()],
        )
        .await
    }

    /// All rows in one transaction.
    async fn save_batch(&self, records: &[OperationRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        for record in records {
            let last_error = match &record.last_error {
                Some(e) => Some(serde_json::to_string(e).map_err(|e| StorageError::Backend(e.to_string()))?),
                None => None,
            };
            sqlx::query(
                "INSERT INTO operations (id, kind, entity_id, payload, created_at, attempts, status, not_before, last_error, seq)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    payload = excluded.payload,
                    attempts = excluded.attempts,
                    status = excluded.status,
                    not_before = excluded.not_before,
                    last_error = excluded.last_error",
            )
            .bind(record.id.as_str())
            .bind(record.kind.as_str())
            .bind(&record.entity_id)
            .bind(&record.payload)
            .bind(record.created_at)
            .bind(i64::from(record.attempts))
            .bind(record.status.as_str())
            .bind(record.not_before)
            .bind(&last_error)
            .bind(record.seq as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StorageError::Backend(e.to_string()))
    }
}
