//! Session metadata storage and status bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use super::{SessionId, SessionStatus};
use crate::error::RelayError;
use crate::store::{format_ts, is_unique_violation, parse_ts, Database};
use crate::Result;

/// Parameters for creating a new session row.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Session kind; must be a valid id prefix.
    pub kind: String,
    /// Already-resolved owner identity, if any.
    pub owner_user_id: Option<String>,
    /// Working directory for the session's process.
    pub workspace_path: Option<String>,
    /// Free-form metadata stored as JSON.
    pub metadata: serde_json::Value,
}

impl NewSession {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            metadata: serde_json::Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_user_id = Some(owner.into());
        self
    }

    pub fn workspace(mut self, path: impl Into<String>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Mint an id and build the `starting` record without storing it.
    pub fn into_record(self) -> Result<SessionRecord> {
        let now = Utc::now();
        Ok(SessionRecord {
            id: SessionId::new(&self.kind)?,
            owner_user_id: self.owner_user_id,
            kind: self.kind,
            status: SessionStatus::Starting,
            workspace_path: self.workspace_path,
            created_at: now,
            updated_at: now,
            meta: self.metadata,
        })
    }
}

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub owner_user_id: Option<String>,
    pub kind: String,
    pub status: SessionStatus,
    pub workspace_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

/// Optional filter for [`SessionRepository::find_all`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub owner_user_id: Option<String>,
    pub kind: Option<String>,
}

impl SessionFilter {
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_user_id = Some(owner.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    fn matches(&self, record: &SessionRecord) -> bool {
        self.status.map_or(true, |s| s == record.status)
            && self
                .owner_user_id
                .as_ref()
                .map_or(true, |o| record.owner_user_id.as_ref() == Some(o))
            && self.kind.as_ref().map_or(true, |k| &record.kind == k)
    }
}

const SELECT_COLUMNS: &str = "SELECT run_id, owner_user_id, kind, status, workspace_path,
        created_at, updated_at, meta_json FROM sessions";

fn conversion_error(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let meta: String = row.get(7)?;
    Ok(SessionRecord {
        id: id.parse().map_err(conversion_error)?,
        owner_user_id: row.get(1)?,
        kind: row.get(2)?,
        status: status.parse().map_err(conversion_error)?,
        workspace_path: row.get(4)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        meta: serde_json::from_str(&meta).map_err(conversion_error)?,
    })
}

/// CRUD over the `sessions` table.
#[derive(Clone)]
pub struct SessionRepository {
    db: Arc<Database>,
}

impl SessionRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Allocate an id and insert a `starting` session.
    pub fn create(&self, new: NewSession) -> Result<SessionRecord> {
        let record = new.into_record()?;
        self.insert(&record)?;
        debug!(session_id = %record.id, kind = %record.kind, "Session row created");
        Ok(record)
    }

    /// Insert a fully-formed record. Duplicate ids fail with
    /// [`RelayError::Uniqueness`].
    pub fn insert(&self, record: &SessionRecord) -> Result<()> {
        let meta = serde_json::to_string(&record.meta)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions
                 (run_id, owner_user_id, kind, status, workspace_path, created_at, updated_at, meta_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.as_str(),
                    record.owner_user_id,
                    record.kind,
                    record.status.as_str(),
                    record.workspace_path,
                    format_ts(record.created_at),
                    format_ts(record.updated_at),
                    meta
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RelayError::Uniqueness(format!("session {} already exists", record.id))
                } else {
                    RelayError::Storage(e)
                }
            })?;
            Ok(())
        })
    }

    /// Look up a session. Not-found is `Ok(None)`.
    pub fn find_by_id(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        self.db.with_conn(|conn| {
            let sql = format!("{} WHERE run_id = ?1", SELECT_COLUMNS);
            Ok(conn
                .query_row(&sql, params![id.as_str()], map_row)
                .optional()?)
        })
    }

    /// Move a session to `status`, rejecting transitions the status machine
    /// does not allow.
    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<SessionRecord> {
        let now = Utc::now();
        let updated = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sql = format!("{} WHERE run_id = ?1", SELECT_COLUMNS);
            let mut record = tx
                .query_row(&sql, params![id.as_str()], map_row)
                .optional()?
                .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;

            record.status.transition_to(status)?;
            record.updated_at = now;

            tx.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![status.as_str(), format_ts(now), id.as_str()],
            )?;
            tx.commit()?;
            Ok(record)
        })?;
        debug!(session_id = %id, status = %status, "Session status updated");
        Ok(updated)
    }

    /// Replace a session's metadata.
    pub fn update_meta(&self, id: &SessionId, meta: &serde_json::Value) -> Result<()> {
        let meta = serde_json::to_string(meta)?;
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET meta_json = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![meta, format_ts(Utc::now()), id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(RelayError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// All sessions ordered by creation time, optionally filtered.
    pub fn find_all(&self, filter: Option<&SessionFilter>) -> Result<Vec<SessionRecord>> {
        let records = self.db.with_conn(|conn| {
            let sql = format!("{} ORDER BY created_at ASC, run_id ASC", SELECT_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], map_row)?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })?;
        Ok(match filter {
            Some(filter) => records.into_iter().filter(|r| filter.matches(r)).collect(),
            None => records,
        })
    }

    /// Delete a session and, through the foreign key, its events.
    ///
    /// Returns whether a row existed.
    pub fn delete(&self, id: &SessionId) -> Result<bool> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE run_id = ?1", params![id.as_str()])?)
        })?;
        Ok(deleted > 0)
    }

    /// Number of stored sessions.
    pub fn count(&self) -> usize {
        self.db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| {
                    row.get::<_, i64>(0)
                })?)
            })
            .map(|n| usize::try_from(n).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::store::{EventStore, FROM_START};
    use serde_json::json;

    fn repo() -> SessionRepository {
        SessionRepository::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_create_session() {
        let repo = repo();
        let record = repo
            .create(
                NewSession::new("pty")
                    .owner("user-1")
                    .workspace("/tmp")
                    .metadata(json!({ "title": "scratch" })),
            )
            .unwrap();

        assert_eq!(record.status, SessionStatus::Starting);
        assert_eq!(record.kind, "pty");
        assert_eq!(record.id.kind(), "pty");
        assert_eq!(repo.count(), 1);

        let found = repo.find_by_id(&record.id).unwrap().unwrap();
        assert_eq!(found.owner_user_id.as_deref(), Some("user-1"));
        assert_eq!(found.workspace_path.as_deref(), Some("/tmp"));
        assert_eq!(found.meta["title"], "scratch");
    }

    #[test]
    fn test_find_nonexistent() {
        let repo = repo();
        let ghost = SessionId::new("pty").unwrap();
        assert!(repo.find_by_id(&ghost).unwrap().is_none());
    }

    #[test]
    fn test_create_invalid_kind() {
        let repo = repo();
        assert!(repo.create(NewSession::new("Not A Kind")).is_err());
        assert_eq!(repo.count(), 0);
    }

    #[test]
    fn test_duplicate_insert_is_uniqueness_error() {
        let repo = repo();
        let record = repo.create(NewSession::new("pty")).unwrap();

        let err = repo.insert(&record).unwrap_err();
        assert!(matches!(err, RelayError::Uniqueness(_)));
        assert_eq!(repo.count(), 1);
    }

    #[test]
    fn test_update_status_valid_path() {
        let repo = repo();
        let record = repo.create(NewSession::new("pty")).unwrap();

        let running = repo.update_status(&record.id, SessionStatus::Running).unwrap();
        assert_eq!(running.status, SessionStatus::Running);
        assert!(running.updated_at >= record.updated_at);

        let stopped = repo.update_status(&record.id, SessionStatus::Stopped).unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);

        let stored = repo.find_by_id(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
    }

    #[test]
    fn test_update_status_rejects_illegal_transition() {
        let repo = repo();
        let record = repo.create(NewSession::new("pty")).unwrap();

        let err = repo
            .update_status(&record.id, SessionStatus::Stopped)
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidStateTransition { .. }));

        repo.update_status(&record.id, SessionStatus::Error).unwrap();
        assert!(repo
            .update_status(&record.id, SessionStatus::Running)
            .is_err());

        let stored = repo.find_by_id(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
    }

    #[test]
    fn test_update_status_unknown_session() {
        let repo = repo();
        let ghost = SessionId::new("pty").unwrap();
        let err = repo.update_status(&ghost, SessionStatus::Running).unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound(_)));
    }

    #[test]
    fn test_find_all_with_filter() {
        let repo = repo();
        let a = repo.create(NewSession::new("pty").owner("alice")).unwrap();
        let b = repo.create(NewSession::new("agent").owner("bob")).unwrap();
        let _c = repo.create(NewSession::new("pty").owner("bob")).unwrap();
        repo.update_status(&a.id, SessionStatus::Running).unwrap();

        assert_eq!(repo.find_all(None).unwrap().len(), 3);

        let running = repo
            .find_all(Some(&SessionFilter::default().status(SessionStatus::Running)))
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let bobs = repo
            .find_all(Some(&SessionFilter::default().owner("bob")))
            .unwrap();
        assert_eq!(bobs.len(), 2);

        let bob_agents = repo
            .find_all(Some(&SessionFilter::default().owner("bob").kind("agent")))
            .unwrap();
        assert_eq!(bob_agents.len(), 1);
        assert_eq!(bob_agents[0].id, b.id);
    }

    #[test]
    fn test_update_meta() {
        let repo = repo();
        let record = repo.create(NewSession::new("agent")).unwrap();
        repo.update_meta(&record.id, &json!({ "externalId": "abc" }))
            .unwrap();

        let stored = repo.find_by_id(&record.id).unwrap().unwrap();
        assert_eq!(stored.meta["externalId"], "abc");
    }

    #[test]
    fn test_delete_cascades_events() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let repo = SessionRepository::new(Arc::clone(&db));
        let store = EventStore::new(db);
        let record = repo.create(NewSession::new("pty")).unwrap();
        store
            .append(&record.id, 0, &NewEvent::new("pty:stdout", "output", b"hi".to_vec()))
            .unwrap();

        assert!(repo.delete(&record.id).unwrap());
        assert!(repo.find_by_id(&record.id).unwrap().is_none());
        assert!(store.get_events(&record.id, FROM_START).unwrap().is_empty());

        // Second delete reports nothing removed
        assert!(!repo.delete(&record.id).unwrap());
    }
}
