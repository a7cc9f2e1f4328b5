//! SQLite connection ownership and schema bootstrap.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{ffi, Connection};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    run_id          TEXT PRIMARY KEY NOT NULL,
    owner_user_id   TEXT,
    kind            TEXT NOT NULL,
    status          TEXT NOT NULL,
    workspace_path  TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    meta_json       TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_user_id);

CREATE TABLE IF NOT EXISTS session_events (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id   TEXT NOT NULL REFERENCES sessions(run_id) ON DELETE CASCADE,
    seq      INTEGER NOT NULL,
    channel  TEXT NOT NULL,
    type     TEXT NOT NULL,
    payload  BLOB NOT NULL,
    ts       TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_session_events_run_seq
    ON session_events(run_id, seq);
";

/// Shared handle to the persistent store.
///
/// A single connection is kept behind a mutex that is held for one
/// statement or one short transaction at a time. Per-session ordering is
/// not derived from this lock; see [`EventRecorder`](super::EventRecorder).
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        info!(path = %path.display(), "Opened session database");
        Self::bootstrap(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        debug!("Opened in-memory session database");
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| RelayError::LockPoisoned)?;
        f(&mut conn)
    }
}

/// Run a storage call on the blocking pool so async workers keep running.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Whether `err` is a SQLite constraint failure with the given extended code.
pub(crate) fn is_constraint(err: &rusqlite::Error, extended: i32) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == extended
    )
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    is_constraint(err, ffi::SQLITE_CONSTRAINT_UNIQUE)
        || is_constraint(err, ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    is_constraint(err, ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_bootstrap() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let names = rows.collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(names)
            })
            .unwrap();
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"session_events".to_string()));
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = Database::open_in_memory().unwrap();
        let enabled: i64 = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_call_leaves_runtime_free() {
        let db = std::sync::Arc::new(Database::open_in_memory().unwrap());
        let (release, held) = std::sync::mpsc::channel::<()>();

        // Holds the connection until released from the runtime thread
        let task = tokio::spawn(blocking(move || {
            db.with_conn(|_| {
                let _ = held.recv();
                Ok(7)
            })
        }));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        release.send(()).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 7);
    }

    #[test]
    fn test_open_file_reopens_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        Database::open(&path).unwrap();
        assert!(path.exists());

        // Bootstrapping an existing file is idempotent
        Database::open(&path).unwrap();
    }
}
