//! Durable append-only event log, one partition per session.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};

use super::db::{is_foreign_key_violation, is_unique_violation, Database};
use crate::error::RelayError;
use crate::event::{NewEvent, SessionEvent};
use crate::session::SessionId;
use crate::Result;

/// Sequence value meaning "before the first event".
pub const FROM_START: i64 = -1;

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Append-only event log.
///
/// `append` takes the sequence number from the caller; assigning it is the
/// job of [`EventRecorder`](super::EventRecorder).
#[derive(Clone)]
pub struct EventStore {
    db: Arc<Database>,
}

impl EventStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one event at `seq`.
    ///
    /// Fails with [`RelayError::Referential`] if the session does not exist
    /// and with [`RelayError::Uniqueness`] if `seq` is already used.
    pub fn append(&self, id: &SessionId, seq: i64, event: &NewEvent) -> Result<SessionEvent> {
        let ts = Utc::now();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM sessions WHERE run_id = ?1",
                    params![id.as_str()],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(RelayError::Referential(id.to_string()));
            }

            tx.execute(
                "INSERT INTO session_events (run_id, seq, channel, type, payload, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    seq,
                    event.channel,
                    event.event_type,
                    event.payload,
                    format_ts(ts)
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RelayError::Uniqueness(format!("seq {} already used for {}", seq, id))
                } else if is_foreign_key_violation(&e) {
                    RelayError::Referential(id.to_string())
                } else {
                    RelayError::Storage(e)
                }
            })?;

            tx.commit()?;

            Ok(SessionEvent {
                session_id: id.clone(),
                seq,
                channel: event.channel.clone(),
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                ts,
            })
        })
    }

    /// Events with `seq > after_seq`, ascending. Pass [`FROM_START`] for the
    /// whole log.
    pub fn get_events(&self, id: &SessionId, after_seq: i64) -> Result<Vec<SessionEvent>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT seq, channel, type, payload, ts
                 FROM session_events
                 WHERE run_id = ?1 AND seq > ?2
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![id.as_str(), after_seq], |row| {
                let ts: String = row.get(4)?;
                Ok(SessionEvent {
                    session_id: id.clone(),
                    seq: row.get(0)?,
                    channel: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    ts: parse_ts(&ts)?,
                })
            })?;
            let events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    /// Highest stored seq for the session, if it has any events.
    pub fn last_seq(&self, id: &SessionId) -> Result<Option<i64>> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(seq) FROM session_events WHERE run_id = ?1",
                params![id.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )?)
        })
    }

    /// Number of stored events for the session.
    pub fn count(&self, id: &SessionId) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM session_events WHERE run_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )?)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
