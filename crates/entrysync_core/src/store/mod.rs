//! SQLite-backed local replica store.
//!
//! One database holds every table the replica needs:
//!
//! | table                | contents                                          |
//! |----------------------|---------------------------------------------------|
//! | `entries`            | materialized current state, CAS on `transaction_id` |
//! | `entry_transactions` | append-only per-entry transaction log             |
//! | `entry_interactions` | seen/opened state per `(entry, collaborator)`     |
//! | `entry_texts`        | text side index                                   |
//! | `mutations`          | outbox of operations destined for the server      |
//! | `sync_cursors`       | last applied server version per root              |
//!
//! The submodules expose free functions over a [`Connection`]. A
//! [`rusqlite::Transaction`] derefs to a connection, so the same functions
//! compose into atomic units through [`WorkspaceStore::atomic`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};

use crate::error::{Result, SyncError};

pub mod cursors;
pub mod entries;
pub mod interactions;
pub mod mutations;
pub mod texts;
pub mod transactions;

/// Local replica database.
///
/// The connection is wrapped in a `Mutex`. Callers never hold the lock
/// across an `.await`: every closure passed to [`read`](Self::read) or
/// [`atomic`](Self::atomic) is synchronous.
pub struct WorkspaceStore {
    conn: Mutex<Connection>,
}

impl WorkspaceStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database. Data is lost when the store is dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Failed("store lock poisoned".to_string()))
    }

    /// Run read-only (or single-statement) work on the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one SQL transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back
    /// otherwise, so a unit of work is applied entirely or not at all.
    /// Database errors inside the unit surface as [`SyncError::Failed`];
    /// other errors returned by `f` pass through unchanged.
    pub fn atomic<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(unit_failed)?;
        let value = f(&tx).map_err(|e| match e {
            SyncError::Database(e) => unit_failed(e),
            other => other,
        })?;
        tx.commit().map_err(unit_failed)?;
        Ok(value)
    }
}

fn unit_failed(err: rusqlite::Error) -> SyncError {
    SyncError::Failed(format!("atomic write failed: {}", err))
}

impl std::fmt::Debug for WorkspaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceStore").finish_non_exhaustive()
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = OFF;

        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            root_id TEXT NOT NULL,
            attributes TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            updated_at INTEGER,
            updated_by TEXT,
            transaction_id TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_root ON entries(root_id);

        -- No foreign key to entries: a local delete removes the entry row
        -- but keeps the log until the server acknowledges it
        CREATE TABLE IF NOT EXISTS entry_transactions (
            id TEXT PRIMARY KEY,
            entry_id TEXT NOT NULL,
            root_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            data BLOB,
            created_at INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            server_created_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_entry_transactions_entry
            ON entry_transactions(entry_id, id);

        CREATE TABLE IF NOT EXISTS entry_interactions (
            entry_id TEXT NOT NULL,
            collaborator_id TEXT NOT NULL,
            root_id TEXT NOT NULL,
            first_seen_at INTEGER,
            last_seen_at INTEGER,
            first_opened_at INTEGER,
            last_opened_at INTEGER,
            version INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entry_id, collaborator_id)
        );

        CREATE TABLE IF NOT EXISTS entry_texts (
            id TEXT PRIMARY KEY,
            name TEXT,
            text TEXT
        );

        CREATE TABLE IF NOT EXISTS mutations (
            id TEXT PRIMARY KEY,
            mutation_type TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sync_cursors (
            root_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            version INTEGER NOT NULL,
            PRIMARY KEY (root_id, scope)
        );
        "#,
    )?;
    Ok(())
}

/// Convert a column parse failure into a rusqlite conversion error so it can
/// be raised from inside a row-mapping closure.
pub(crate) fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        drop(WorkspaceStore::open(&path).unwrap());
        WorkspaceStore::open(&path).unwrap();
    }

    #[test]
    fn test_atomic_rolls_back_on_error() {
        let store = WorkspaceStore::in_memory().unwrap();
        let result: Result<()> = store.atomic(|tx| {
            tx.execute(
                "INSERT INTO entry_texts (id, name, text) VALUES ('e1', 'A', NULL)",
                [],
            )?;
            Err(SyncError::Failed("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM entry_texts", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_atomic_reports_database_errors_as_failed() {
        let store = WorkspaceStore::in_memory().unwrap();
        let result: Result<()> = store.atomic(|tx| {
            tx.execute("INSERT INTO entry_texts (id, name) VALUES ('e1', 'A')", [])?;
            tx.execute("INSERT INTO entry_texts (id, name) VALUES ('e1', 'B')", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(SyncError::Failed(_))));

        let passthrough: Result<()> =
            store.atomic(|_| Err(SyncError::NotFound("e1".to_string())));
        assert!(matches!(passthrough, Err(SyncError::NotFound(_))));

        let count: i64 = store
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM entry_texts", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
