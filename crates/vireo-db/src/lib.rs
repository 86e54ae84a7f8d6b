//! # vireo-db
//!
//! Database access layer for the Vireo BBS core.
//! Manages the single SQLite database holding users, nodes, boards,
//! messages, federation peers, learned routes, queued mail, and the sync
//! log. Every other component goes through this crate for persistent state.
//!
//! ## Conventions
//!
//! - WAL mode, foreign keys enforced
//! - All timestamps are integer microseconds since epoch
//! - Schema version stored in `PRAGMA user_version`, forward-only
//! - Query modules are free functions over `&Connection`; services share a
//!   [`Db`] handle

pub mod migrations;
pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the database at the given path.
///
/// Configures pragmas and runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Shared handle to the single database connection.
///
/// The connection itself is not thread-safe; callers take the lock for each
/// statement or short transaction and must not hold it across await points.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open a database file and wrap it in a shared handle.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open(path)?))
    }

    /// In-memory handle for tests.
    pub fn open_memory() -> Result<Self> {
        Ok(Self::from_connection(open_memory()?))
    }

    /// Wrap an already-opened connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Take the connection lock.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Map `QueryReturnedNoRows` to a domain-level NotFound.
pub(crate) fn not_found(what: &str) -> impl FnOnce(rusqlite::Error) -> DbError + '_ {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(what.into()),
        other => DbError::Sqlite(other),
    }
}

/// Whether an error is specifically a UNIQUE/PRIMARY KEY violation.
///
/// Foreign-key and other constraint failures must NOT match: the dedup
/// paths treat a unique violation as "already have it", and a misfiled
/// foreign-key error there would silently swallow real faults.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(info, _)
            if info.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || info.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = open_memory().expect("open in-memory db");
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("get user_version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let conn = open_memory().expect("open");
        let fk: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("get foreign_keys");
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_db_handle_clones_share_state() {
        let db = Db::open_memory().expect("open");
        let db2 = db.clone();
        db.lock()
            .execute("INSERT INTO boards (name, created_at_us) VALUES ('general', 1)", [])
            .expect("insert");
        let count: i64 = db2
            .lock()
            .query_row("SELECT COUNT(*) FROM boards", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }
}
