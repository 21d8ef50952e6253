//! Durable work queue of identifiers backed by SQLite.
//!
//! The queue is the single source of truth for what remains to be processed.
//! Each identifier row carries a [`IdentifierStatus`] plus the two result flags.
//! Flags are validated before every write and additionally enforced by table
//! CHECK constraints, so a row can never hold both flags or hold a flag outside
//! `success`.
//!
//! Concurrency: one connection guarded by a mutex. Every operation is a short
//! statement or transaction, so the lock is never held across network I/O.
//!
//! Lifecycle: the connection is opened lazily on first use. Once [`WorkQueue::close`]
//! has been called every further operation fails with [`StoreError::Closed`]; the
//! store never silently reopens, since a fresh schema could wipe accumulated progress.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::handoff;
use crate::identifiers::normalize_identifier;
use crate::stats::RunStats;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identifiers (
    identifier TEXT PRIMARY KEY NOT NULL,
    status     TEXT NOT NULL DEFAULT 'pending'
               CHECK (status IN ('pending', 'success', 'failed')),
    has_result INTEGER NOT NULL DEFAULT 0,
    no_result  INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    CHECK (NOT (has_result = 1 AND no_result = 1)),
    CHECK (status = 'success' OR (has_result = 0 AND no_result = 0))
);
CREATE INDEX IF NOT EXISTS idx_identifiers_status ON identifiers(status);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle status of one identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierStatus {
    Pending,
    Success,
    Failed,
}

impl IdentifierStatus {
    pub const ALL: [IdentifierStatus; 3] = [Self::Pending, Self::Success, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdentifierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("work queue store is closed")]
    Closed,

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("invalid result flags for {identifier}: status={status} has_result={has_result} no_result={no_result}")]
    InvalidFlags {
        identifier: String,
        status: IdentifierStatus,
        has_result: bool,
        no_result: bool,
    },

    #[error("illegal transition for {identifier}: cannot move to {to} through update_status")]
    IllegalTransition {
        identifier: String,
        to: IdentifierStatus,
    },

    #[error("unrecognized status value in store: {0}")]
    CorruptStatus(String),

    #[error("work queue lock poisoned")]
    Poisoned,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the queue lives
#[derive(Debug, Clone, PartialEq)]
enum StoreLocation {
    File(PathBuf),
    Memory,
}

enum Handle {
    Unopened,
    Open(Connection),
    Closed,
}

/// One stored identifier row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierRecord {
    pub identifier: String,
    pub status: IdentifierStatus,
    pub has_result: bool,
    pub no_result: bool,
    pub updated_at: String,
}

pub struct WorkQueue {
    location: StoreLocation,
    handle: Mutex<Handle>,
}

impl WorkQueue {
    /// Create a file-backed queue. Nothing is opened until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            handle: Mutex::new(Handle::Unopened),
        }
    }

    /// Create a transient in-memory queue (tests, dry runs)
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory,
            handle: Mutex::new(Handle::Unopened),
        }
    }

    fn open_connection(location: &StoreLocation) -> Result<Connection, StoreError> {
        let conn = match location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
                conn
            }
            StoreLocation::Memory => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        debug!("Opened work queue at {:?}", location);
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.handle.lock().map_err(|_| StoreError::Poisoned)?;
        if matches!(*guard, Handle::Unopened) {
            *guard = Handle::Open(Self::open_connection(&self.location)?);
        }
        match &mut *guard {
            Handle::Open(conn) => op(conn),
            Handle::Closed | Handle::Unopened => Err(StoreError::Closed),
        }
    }

    /// Insert previously unseen identifiers as `pending`.
    ///
    /// Identifiers are normalized first; rows that already exist are left
    /// untouched. Returns the number of pending rows after the insert.
    pub fn load(&self, identifiers: &[String]) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = insert_pending(&tx, identifiers)?;
            tx.commit()?;

            let pending = count_status(conn, IdentifierStatus::Pending)?;
            debug!("Loaded {} new identifiers ({} pending)", inserted, pending);
            Ok(pending)
        })
    }

    /// Drop every row and load `identifiers` in their place, atomically.
    ///
    /// Returns `(removed, pending)`. On error the previous contents are left
    /// untouched.
    pub fn replace(&self, identifiers: &[String]) -> Result<(usize, usize), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM identifiers", [])?;
            insert_pending(&tx, identifiers)?;
            tx.commit()?;

            let pending = count_status(conn, IdentifierStatus::Pending)?;
            info!("Replaced work queue ({} rows removed, {} pending)", removed, pending);
            Ok((removed, pending))
        })
    }

    /// All identifiers currently in `status`
    pub fn get_by_status(&self, status: IdentifierStatus) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT identifier FROM identifiers WHERE status = ?1")?;
            let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
            let identifiers = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(identifiers)
        })
    }

    /// Fetch a single row
    pub fn get(&self, identifier: &str) -> Result<Option<IdentifierRecord>, StoreError> {
        let identifier = normalize_identifier(identifier);
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT identifier, status, has_result, no_result, updated_at
                     FROM identifiers WHERE identifier = ?1",
                    params![identifier],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, bool>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                None => Ok(None),
                Some((identifier, status, has_result, no_result, updated_at)) => {
                    let status = IdentifierStatus::parse(&status)
                        .ok_or(StoreError::CorruptStatus(status))?;
                    Ok(Some(IdentifierRecord {
                        identifier,
                        status,
                        has_result,
                        no_result,
                        updated_at,
                    }))
                }
            }
        })
    }

    /// Move a pending identifier to a terminal status.
    ///
    /// Returns `Ok(true)` when the transition was applied and `Ok(false)` when the
    /// row had already left `pending` (another writer got there first). Moving a
    /// row back to `pending` is only possible through [`WorkQueue::reset_failed`].
    pub fn update_status(
        &self,
        identifier: &str,
        status: IdentifierStatus,
        has_result: bool,
        no_result: bool,
    ) -> Result<bool, StoreError> {
        let identifier = normalize_identifier(identifier);

        if status == IdentifierStatus::Pending {
            return Err(StoreError::IllegalTransition {
                identifier,
                to: status,
            });
        }

        let flags_ok = match status {
            IdentifierStatus::Success => has_result != no_result,
            _ => !has_result && !no_result,
        };
        if !flags_ok {
            return Err(StoreError::InvalidFlags {
                identifier,
                status,
                has_result,
                no_result,
            });
        }

        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE identifiers
                 SET status = ?1, has_result = ?2, no_result = ?3, updated_at = ?4
                 WHERE identifier = ?5 AND status = 'pending'",
                params![status.as_str(), has_result, no_result, now, identifier],
            )?;
            if changed > 0 {
                return Ok(true);
            }

            let exists: Option<String> = conn
                .query_row(
                    "SELECT status FROM identifiers WHERE identifier = ?1",
                    params![identifier],
                    |row| row.get(0),
                )
                .optional()?;
            match exists {
                Some(current) => {
                    debug!("Skipped {} for {} (already {})", status, identifier, current);
                    Ok(false)
                }
                None => Err(StoreError::UnknownIdentifier(identifier)),
            }
        })
    }

    /// Bulk `failed -> pending` transition that gives failed identifiers a fresh
    /// attempt budget. Returns the number of rows reset.
    pub fn reset_failed(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let reset = conn.execute(
                "UPDATE identifiers
                 SET status = 'pending', has_result = 0, no_result = 0, updated_at = ?1
                 WHERE status = 'failed'",
                params![now],
            )?;
            info!("Reset {} failed identifiers to pending", reset);
            Ok(reset)
        })
    }

    /// Counts per status plus result flag totals, taken in a single statement so
    /// the numbers are mutually consistent.
    pub fn stats(&self) -> Result<RunStats, StoreError> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(has_result), 0),
                    COALESCE(SUM(no_result), 0)
                 FROM identifiers",
                [],
                |row| {
                    Ok(RunStats {
                        total: row.get::<_, i64>(0)? as usize,
                        pending: row.get::<_, i64>(1)? as usize,
                        success: row.get::<_, i64>(2)? as usize,
                        failed: row.get::<_, i64>(3)? as usize,
                        has_result: row.get::<_, i64>(4)? as usize,
                        no_result: row.get::<_, i64>(5)? as usize,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    /// Write every pending identifier to a hand-off file. Returns the count written.
    pub fn export_pending(&self, path: &Path) -> Result<usize, StoreError> {
        let pending = self.get_by_status(IdentifierStatus::Pending)?;
        handoff::write_handoff(path, &pending)?;
        info!("Exported {} pending identifiers to {}", pending.len(), path.display());
        Ok(pending.len())
    }

    /// Release the connection. Every later operation fails with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.handle.lock().map_err(|_| StoreError::Poisoned)?;
        let previous = std::mem::replace(&mut *guard, Handle::Closed);
        if let Handle::Open(conn) = previous {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            debug!("Closed work queue at {:?}", self.location);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.handle
            .lock()
            .map(|guard| matches!(*guard, Handle::Closed))
            .unwrap_or(true)
    }
}

/// `INSERT OR IGNORE` each normalized identifier as pending; returns the rows added
fn insert_pending(conn: &Connection, identifiers: &[String]) -> Result<usize, StoreError> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO identifiers (identifier, status, has_result, no_result, updated_at)
         VALUES (?1, 'pending', 0, 0, ?2)",
    )?;
    let mut inserted = 0usize;
    for raw in identifiers {
        let identifier = normalize_identifier(raw);
        if identifier.is_empty() {
            continue;
        }
        inserted += stmt.execute(params![identifier, now])?;
    }
    Ok(inserted)
}

fn count_status(conn: &Connection, status: IdentifierStatus) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM identifiers WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
