//! SQLite connection management for the orchestration store.
//!
//! The engine's write pattern is bursty and strictly serialized per
//! workflow: each completion signal rewrites one workflow document and
//! appends a handful of audit rows in quick succession. A single writer
//! connection turns those bursts into a queue instead of `SQLITE_BUSY`
//! churn, and WAL lets the readers keep serving status/audit queries
//! while a write is in flight. Audit appends dominate the write volume,
//! so the writer runs with `synchronous=NORMAL`, which in WAL mode keeps
//! the log durable across application crashes without an fsync per
//! append.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Readers serve CLI status/audit queries and the occasional mapping
/// lookup; a small pool is plenty.
const READER_CONNECTIONS: u32 = 4;

/// Completion bursts queue on the single writer; give queued writers
/// time to drain before surfacing SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

fn connect_options(database_url: &str, read_only: bool) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .read_only(read_only)
        .create_if_missing(!read_only)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT))
}

/// Split read/write SQLite pools for the workflow store.
#[derive(Clone)]
pub struct DatabasePool {
    reader: SqlitePool,
    writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) and migrate the database, then attach
    /// the read-only pool.
    pub async fn open(database_url: &str) -> Result<Self, sqlx::Error> {
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(database_url, false)?)
            .await?;

        // The schema must exist before the read-only pool connects.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(connect_options(database_url, true)?)
            .await?;

        Ok(Self { reader, writer })
    }

    /// Pool for SELECT queries.
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Single-connection pool serializing all writes.
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }
}

/// Default database URL: `$CADENZA_DATA_DIR/cadenza.db`, falling back to
/// `~/.cadenza/cadenza.db`.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("CADENZA_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cadenza")
        });
    format!("sqlite://{}", data_dir.join("cadenza.db").display())
}
