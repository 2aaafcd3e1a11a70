//! SQLite-backed persistence shared by the registry, folio store, request
//! store and lock service.
//!
//! One `Database` wraps one connection. Separate processes (or threads that
//! want real concurrency) open their own `Database` on the same file; writers
//! are serialized by `BEGIN IMMEDIATE` and WAL mode.

pub mod rows;
pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{FolioError, FolioResult};
pub use schema::FOLIO_SCHEMA;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared SQLite handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open a file-backed database.
    pub fn open(path: &Path) -> FolioResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn memory() -> FolioResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Wrap an existing connection, bootstrapping the schema.
    pub fn from_connection(conn: Connection) -> FolioResult<Self> {
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> FolioResult<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(FOLIO_SCHEMA)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> FolioResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FolioError::Database("connection mutex poisoned".to_string()))
    }

    /// Run `f` inside `BEGIN IMMEDIATE`, committing on `Ok` and rolling back
    /// on `Err`. The write lock is taken up front so concurrent writers in
    /// other connections queue on `busy_timeout` instead of failing mid-way.
    pub(crate) fn immediate<T>(
        &self,
        f: impl FnOnce(&Connection) -> FolioResult<T>,
    ) -> FolioResult<T> {
        let conn = self.conn()?;

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = f(&conn);

        match &result {
            Ok(_) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }

        result
    }
}

pub(crate) fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> FolioResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| FolioError::Database(format!("timestamp out of range: {ms}")))
}

pub(crate) fn from_ms_opt(ms: Option<i64>) -> FolioResult<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

pub(crate) fn to_db_number(n: u64) -> FolioResult<i64> {
    i64::try_from(n).map_err(|_| FolioError::InvalidRange {
        reason: format!("number {n} exceeds storage range"),
    })
}

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_bootstraps_schema() {
        let db = Database::memory().unwrap();
        let conn = db.conn().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for t in ["authorization_ranges", "folios", "locks", "replenishment_requests"] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }
    }

    #[test]
    fn test_store_sets_foreign_keys() {
        let db = Database::memory().unwrap();
        let conn = db.conn().unwrap();
        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_immediate_rolls_back_on_error() {
        let db = Database::memory().unwrap();
        let result: FolioResult<()> = db.immediate(|conn| {
            conn.execute(
                "INSERT INTO locks (lock_key, holder_token, fencing_token, acquired_at_ms, deadline_ms)
                 VALUES ('k', 't', 1, 0, 10)",
                [],
            )?;
            Err(FolioError::InvalidRequest {
                reason: "abort".into(),
            })
        });
        assert!(result.is_err());

        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM locks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_ms_roundtrip_preserves_millis() {
        let t = DateTime::from_timestamp_millis(1_760_000_123_456).unwrap();
        assert_eq!(from_ms(to_ms(t)).unwrap(), t);
    }
}
