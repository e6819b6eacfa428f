//! SQLite-backed durable state shared by the registry, index, task arena and
//! temperature tables.
//!
//! One database file holds everything so that a migration's completion can
//! update the placement record and the task phase in a single transaction.
//! WAL mode keeps readers (snapshots) from blocking the writers.

use crate::config::LayoutConfig;
use crate::{Result, TierError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Handle to the state database. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the state database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| TierError::Io {
                    message: format!("Failed to create state directory: {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        debug!("Opened state store at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=FULL;\n\
             PRAGMA foreign_keys=ON;",
            LayoutConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS drives (
                id TEXT PRIMARY KEY,
                mount_path TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                free_bytes INTEGER NOT NULL DEFAULT 0,
                health TEXT NOT NULL,
                device_path TEXT,
                fs_type TEXT,
                registered_at TEXT NOT NULL,
                refreshed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS placements (
                path TEXT PRIMARY KEY,
                drive_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                size INTEGER NOT NULL,
                fingerprint TEXT,
                state TEXT NOT NULL,
                task_id TEXT,
                modified_at INTEGER NOT NULL DEFAULT 0,
                observed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_placements_drive ON placements(drive_id);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                source_drive TEXT NOT NULL,
                dest_drive TEXT NOT NULL,
                size INTEGER NOT NULL,
                reason TEXT NOT NULL,
                phase TEXT NOT NULL,
                failure TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                source_fingerprint TEXT,
                not_before INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                dismissed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_phase ON tasks(phase);
            CREATE INDEX IF NOT EXISTS idx_tasks_path ON tasks(path);

            CREATE TABLE IF NOT EXISTS temperatures (
                path TEXT PRIMARY KEY,
                score REAL NOT NULL,
                scored_at INTEGER NOT NULL,
                last_access INTEGER NOT NULL,
                access_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                source TEXT PRIMARY KEY,
                position INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Lock the connection for a sequence of statements.
    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TierError::Database {
            message: "Failed to acquire state store lock".to_string(),
            source: None,
        })
    }

    /// Run `f` inside an immediate transaction; commit on `Ok`, roll back on `Err`.
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Decode a text column through a parser, reporting unknown values as a
/// conversion failure of column `idx`.
pub(crate) fn decode<T>(idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value {:?}", raw).into(),
        )
    })
}

/// Decode an RFC 3339 timestamp column.
pub(crate) fn decode_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
