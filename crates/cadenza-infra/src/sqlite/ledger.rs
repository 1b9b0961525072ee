//! SQLite completion-signal idempotency ledger.
//!
//! Stores composite `{issue}:{agent}:{event_id}` keys. Insertion is the
//! dedupe gate: a key that already exists means the signal is a duplicate.
//! The table is size-bounded; once capacity is exceeded the oldest rows
//! (by insertion order) are evicted. Persistent across restarts.

use cadenza_core::store::CompletionLedger;
use cadenza_types::error::StorageError;
use chrono::Utc;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed `CompletionLedger` with capacity-based eviction.
pub struct SqliteCompletionLedger {
    pool: DatabasePool,
    capacity: u64,
}

impl SqliteCompletionLedger {
    /// Create a ledger with the given retention capacity (typically the
    /// orchestration `dedupe_cache_size`).
    pub fn new(pool: DatabasePool, capacity: usize) -> Self {
        Self {
            pool,
            capacity: capacity.max(1) as u64,
        }
    }
}

impl CompletionLedger for SqliteCompletionLedger {
    async fn check_and_insert(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO completion_ledger (key, inserted_at) VALUES (?, ?)",
        )
        .bind(key)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool.writer())
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Key already present: duplicate signal.
            return Ok(false);
        }

        // Evict oldest entries beyond capacity (insertion order = rowid).
        sqlx::query(
            "DELETE FROM completion_ledger WHERE rowid NOT IN
               (SELECT rowid FROM completion_ledger ORDER BY rowid DESC LIMIT ?)",
        )
        .bind(self.capacity as i64)
        .execute(self.pool.writer())
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(true)
    }

    async fn len(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM completion_ledger")
            .fetch_one(self.pool.reader())
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        let count: i64 = row
            .try_get("count")
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(count as u64)
    }
}
