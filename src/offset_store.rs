// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable offset storage for projections.
//!
//! One row per `(projection_name, projection_key)` holds the offset
//! timestamp; an auxiliary table holds the `seen` entries for exactly that
//! timestamp. Both are written in one transaction, so an offset is either
//! fully committed or not at all; a cancelled write can be treated as
//! possibly-committed and resolved by re-reading on restart.
//!
//! # Version fencing
//!
//! Every save increments a `version` column and asserts the version the
//! caller last observed. Two live projections sharing a ProjectionId
//! interleave saves, trip the assertion, and surface a `Consistency` error
//! instead of silently thrashing each other's progress.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff, a bounded number of
//! times; what escapes becomes a stream failure and the projection
//! restarts from the last committed offset.

use crate::envelope::{ProjectionId, TimestampOffset};
use crate::error::{ReplicationError, Result};
use chrono::TimeZone;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// A loaded offset with its fencing version.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOffset {
    pub offset: TimestampOffset,
    pub version: i64,
}

/// Persistent offset storage backed by SQLite.
pub struct OffsetStore {
    pool: SqlitePool,
    path: String,
}

impl OffsetStore {
    /// Open (and create if missing) the store at the given path.
    ///
    /// Pass `":memory:"` for an ephemeral store in tests.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing offset store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .create_if_missing(true);
        if !in_memory {
            options = options
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // An in-memory database exists per connection; pooling above one
        // connection would shear it apart.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 2 })
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_offset (
                projection_name TEXT NOT NULL,
                projection_key  TEXT NOT NULL,
                ts_micros       INTEGER NOT NULL,
                version         INTEGER NOT NULL,
                PRIMARY KEY (projection_name, projection_key)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projection_offset_seen (
                projection_name TEXT NOT NULL,
                projection_key  TEXT NOT NULL,
                persistence_id  TEXT NOT NULL,
                seq_nr          INTEGER NOT NULL,
                PRIMARY KEY (projection_name, projection_key, persistence_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Load the stored offset for a projection, if any.
    pub async fn load(&self, id: &ProjectionId) -> Result<Option<StoredOffset>> {
        let pool = &self.pool;
        let name = id.name().to_string();
        let key = id.key().to_string();

        let row: Option<(i64, i64)> = execute_with_retry("offset_load", || async {
            sqlx::query_as(
                "SELECT ts_micros, version FROM projection_offset \
                 WHERE projection_name = ? AND projection_key = ?",
            )
            .bind(&name)
            .bind(&key)
            .fetch_optional(pool)
            .await
        })
        .await?;

        let Some((ts_micros, version)) = row else {
            return Ok(None);
        };

        let seen_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT persistence_id, seq_nr FROM projection_offset_seen \
             WHERE projection_name = ? AND projection_key = ?",
        )
        .bind(&name)
        .bind(&key)
        .fetch_all(pool)
        .await?;

        let timestamp = chrono::Utc
            .timestamp_micros(ts_micros)
            .single()
            .ok_or_else(|| {
                ReplicationError::Internal(format!("corrupt offset timestamp {}", ts_micros))
            })?;
        let mut offset = TimestampOffset::new(timestamp);
        for (pid, seq_nr) in seen_rows {
            offset.seen.insert(pid, seq_nr);
        }

        debug!(projection_id = %id, version, "Loaded offset");
        Ok(Some(StoredOffset { offset, version }))
    }

    /// Save the offset, asserting the version last observed by this caller.
    ///
    /// `expected_version` of `None` asserts that no row exists yet. Returns
    /// the new version. A mismatch means another live projection wrote the
    /// row and surfaces as a `Consistency` error.
    pub async fn save(
        &self,
        id: &ProjectionId,
        offset: &TimestampOffset,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        let start = std::time::Instant::now();
        let result: Result<i64> = execute_with_retry("offset_save", || async {
            let mut tx = self.pool.begin().await?;
            match Self::save_in_tx_inner(&mut tx, id, offset, expected_version).await {
                Ok(version) => {
                    tx.commit().await?;
                    Ok(Ok(version))
                }
                // Database errors go back to the retry helper; fencing
                // violations and the like travel out as Ok(Err).
                Err(ReplicationError::OffsetStore(e)) => Err(e),
                Err(e) => Ok(Err(e)),
            }
        })
        .await?;

        crate::metrics::record_offset_saved(&id.to_string(), result.is_ok());
        crate::metrics::record_offset_save_latency(&id.to_string(), start.elapsed());
        result
    }

    /// Begin a transaction on the offset store.
    ///
    /// Exactly-once handlers run their side effect and
    /// [`save_in_tx`](Self::save_in_tx) inside the same transaction.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Save the offset inside a caller-owned transaction.
    pub async fn save_in_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        id: &ProjectionId,
        offset: &TimestampOffset,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        Self::save_in_tx_inner(tx, id, offset, expected_version).await
    }

    async fn save_in_tx_inner(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        id: &ProjectionId,
        offset: &TimestampOffset,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        let current: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM projection_offset \
             WHERE projection_name = ? AND projection_key = ?",
        )
        .bind(id.name())
        .bind(id.key())
        .fetch_optional(&mut **tx)
        .await?;
        let current = current.map(|(v,)| v);

        if current != expected_version {
            return Err(ReplicationError::Consistency {
                projection_id: id.to_string(),
                expected: expected_version.unwrap_or(0),
                found: current.unwrap_or(0),
            });
        }

        let new_version = expected_version.unwrap_or(0) + 1;
        sqlx::query(
            r#"
            INSERT INTO projection_offset (projection_name, projection_key, ts_micros, version)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(projection_name, projection_key) DO UPDATE SET
                ts_micros = excluded.ts_micros,
                version = excluded.version
            "#,
        )
        .bind(id.name())
        .bind(id.key())
        .bind(offset.timestamp.timestamp_micros())
        .bind(new_version)
        .execute(&mut **tx)
        .await?;

        // The seen rows are replaced wholesale; only entities at exactly
        // the offset timestamp belong here, so the set stays small.
        sqlx::query(
            "DELETE FROM projection_offset_seen \
             WHERE projection_name = ? AND projection_key = ?",
        )
        .bind(id.name())
        .bind(id.key())
        .execute(&mut **tx)
        .await?;
        for (pid, seq_nr) in &offset.seen {
            sqlx::query(
                "INSERT INTO projection_offset_seen \
                 (projection_name, projection_key, persistence_id, seq_nr) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id.name())
            .bind(id.key())
            .bind(pid)
            .bind(seq_nr)
            .execute(&mut **tx)
            .await?;
        }

        Ok(new_version)
    }

    /// Delete a projection's offset (e.g. to rebuild a projection from the
    /// beginning).
    pub async fn clear(&self, id: &ProjectionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM projection_offset WHERE projection_name = ? AND projection_key = ?",
        )
        .bind(id.name())
        .bind(id.key())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM projection_offset_seen WHERE projection_name = ? AND projection_key = ?",
        )
        .bind(id.name())
        .bind(id.key())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(projection_id = %id, "Cleared offset");
        Ok(())
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Offset store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn ts(micros: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_micros(micros).unwrap()
    }

    fn pid() -> ProjectionId {
        ProjectionId::new("cart-events", "cart-0-255")
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let store = OffsetStore::new(":memory:").await.unwrap();
        assert!(store.load(&pid()).await.unwrap().is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = OffsetStore::new(":memory:").await.unwrap();

        let mut offset = TimestampOffset::single(ts(5_000_000), "x", 4);
        offset.observe(ts(5_000_000), "y", 9);

        let version = store.save(&pid(), &offset, None).await.unwrap();
        assert_eq!(version, 1);

        let stored = store.load(&pid()).await.unwrap().unwrap();
        assert_eq!(stored.offset, offset);
        assert_eq!(stored.version, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_save_replaces_seen_rows() {
        let store = OffsetStore::new(":memory:").await.unwrap();

        let first = TimestampOffset::single(ts(1_000_000), "a", 1);
        let v1 = store.save(&pid(), &first, None).await.unwrap();

        // Newer timestamp: previous seen entries must vanish.
        let second = TimestampOffset::single(ts(2_000_000), "b", 7);
        let v2 = store.save(&pid(), &second, Some(v1)).await.unwrap();
        assert_eq!(v2, 2);

        let stored = store.load(&pid()).await.unwrap().unwrap();
        assert_eq!(stored.offset.seen.len(), 1);
        assert_eq!(stored.offset.seen.get("b"), Some(&7));
        store.close().await;
    }

    #[tokio::test]
    async fn test_version_fencing_detects_collision() {
        let store = OffsetStore::new(":memory:").await.unwrap();

        let offset = TimestampOffset::single(ts(1_000_000), "a", 1);
        let v1 = store.save(&pid(), &offset, None).await.unwrap();

        // A second projection instance saves under the same id.
        let intruder = TimestampOffset::single(ts(3_000_000), "z", 2);
        store.save(&pid(), &intruder, Some(v1)).await.unwrap();

        // The original instance still believes version v1.
        let offset2 = TimestampOffset::single(ts(2_000_000), "a", 2);
        let err = store.save(&pid(), &offset2, Some(v1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Consistency { .. }));
        store.close().await;
    }

    #[tokio::test]
    async fn test_save_none_expected_fails_when_row_exists() {
        let store = OffsetStore::new(":memory:").await.unwrap();
        let offset = TimestampOffset::single(ts(1_000_000), "a", 1);
        store.save(&pid(), &offset, None).await.unwrap();

        let err = store.save(&pid(), &offset, None).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Consistency { .. }));
        store.close().await;
    }

    #[tokio::test]
    async fn test_projections_are_isolated() {
        let store = OffsetStore::new(":memory:").await.unwrap();
        let other = ProjectionId::new("cart-events", "cart-256-511");

        let offset = TimestampOffset::single(ts(1_000_000), "a", 1);
        store.save(&pid(), &offset, None).await.unwrap();

        assert!(store.load(&other).await.unwrap().is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("offsets.db");

        let offset = TimestampOffset::single(ts(9_000_000), "a", 3);
        {
            let store = OffsetStore::new(&db_path).await.unwrap();
            store.save(&pid(), &offset, None).await.unwrap();
            store.close().await;
        }
        {
            let store = OffsetStore::new(&db_path).await.unwrap();
            let stored = store.load(&pid()).await.unwrap().unwrap();
            assert_eq!(stored.offset, offset);
            assert_eq!(stored.version, 1);
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_clear_removes_both_tables() {
        let store = OffsetStore::new(":memory:").await.unwrap();
        let offset = TimestampOffset::single(ts(1_000_000), "a", 1);
        store.save(&pid(), &offset, None).await.unwrap();

        store.clear(&pid()).await.unwrap();
        assert!(store.load(&pid()).await.unwrap().is_none());

        // After a clear, a fresh save starts the version fence over.
        let version = store.save(&pid(), &offset, None).await.unwrap();
        assert_eq!(version, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_save_in_caller_transaction() {
        let store = OffsetStore::new(":memory:").await.unwrap();
        let offset = TimestampOffset::single(ts(1_000_000), "a", 1);

        // Rolled-back transaction leaves no offset behind.
        {
            let mut tx = store.begin().await.unwrap();
            OffsetStore::save_in_tx(&mut tx, &pid(), &offset, None)
                .await
                .unwrap();
            tx.rollback().await.unwrap();
        }
        assert!(store.load(&pid()).await.unwrap().is_none());

        // Committed transaction persists.
        {
            let mut tx = store.begin().await.unwrap();
            OffsetStore::save_in_tx(&mut tx, &pid(), &offset, None)
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        assert!(store.load(&pid()).await.unwrap().is_some());
        store.close().await;
    }

    #[test]
    fn test_is_sqlite_busy_error_classification() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
