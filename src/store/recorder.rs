//! Per-session sequencer on top of the event store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use super::EventStore;
use crate::error::RelayError;
use crate::event::{NewEvent, SessionEvent};
use crate::session::SessionId;
use crate::Result;

/// Next sequence number for one session; `None` until loaded from the store.
#[derive(Debug, Default)]
struct SeqCursor {
    next: Option<i64>,
}

/// Assigns contiguous sequence numbers and appends events in that order.
///
/// Calls for the same session are serialized by a per-session lock which
/// also caches the next seq, so the store is only consulted on first use.
/// Calls for different sessions never wait on each other beyond the short
/// lookup in the cursor map.
pub struct EventRecorder {
    store: EventStore,
    cursors: Mutex<HashMap<SessionId, Arc<Mutex<SeqCursor>>>>,
}

impl EventRecorder {
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    fn cursor(&self, id: &SessionId) -> Result<Arc<Mutex<SeqCursor>>> {
        let mut cursors = self.cursors.lock().map_err(|_| RelayError::LockPoisoned)?;
        Ok(Arc::clone(cursors.entry(id.clone()).or_default()))
    }

    /// Sequence `event` for session `id` and persist it.
    ///
    /// Returns the stored event with its assigned seq. Fails with
    /// [`RelayError::Referential`] if the session row does not exist.
    pub fn record_event(&self, id: &SessionId, event: NewEvent) -> Result<SessionEvent> {
        let handle = self.cursor(id)?;
        let mut cursor = handle.lock().map_err(|_| RelayError::LockPoisoned)?;

        let seq = match cursor.next {
            Some(next) => next,
            None => self.store.last_seq(id)?.map_or(0, |last| last + 1),
        };

        match self.store.append(id, seq, &event) {
            Ok(stored) => {
                cursor.next = Some(seq + 1);
                trace!(session_id = %id, seq, channel = %stored.channel, "Recorded event");
                Ok(stored)
            }
            Err(e) => {
                // Reload from the store on the next call rather than trusting the cache
                cursor.next = None;
                if e.is_integrity() {
                    warn!(session_id = %id, seq, error = %e, "Event rejected by store");
                }
                if matches!(e, RelayError::Referential(_)) {
                    drop(cursor);
                    self.discard(id, &handle);
                }
                Err(e)
            }
        }
    }

    /// Remove `handle` from the map unless another cursor replaced it.
    fn discard(&self, id: &SessionId, handle: &Arc<Mutex<SeqCursor>>) {
        if let Ok(mut cursors) = self.cursors.lock() {
            if cursors.get(id).is_some_and(|c| Arc::ptr_eq(c, handle)) {
                cursors.remove(id);
            }
        }
    }

    /// Drop the cached cursor of a finished or deleted session.
    pub fn forget(&self, id: &SessionId) {
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.remove(id);
        }
    }

    /// Number of sessions with a cached cursor.
    pub fn tracked(&self) -> usize {
        self.cursors.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{NewSession, SessionRepository};
    use crate::store::{Database, FROM_START};
    use std::collections::HashSet;
    use std::thread;

    fn setup() -> (Arc<EventRecorder>, SessionRepository) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let recorder = EventRecorder::new(EventStore::new(Arc::clone(&db)));
        (Arc::new(recorder), SessionRepository::new(db))
    }

    fn chunk(n: usize) -> NewEvent {
        NewEvent::new("pty:stdout", "output", n.to_string().into_bytes())
    }

    #[test]
    fn test_sequential_recording() {
        let (recorder, repo) = setup();
        let session = repo.create(NewSession::new("pty")).unwrap();

        for expected in 0..3 {
            let event = recorder.record_event(&session.id, chunk(0)).unwrap();
            assert_eq!(event.seq, expected);
        }
    }

    #[test]
    fn test_concurrent_same_session_is_gap_free() {
        let (recorder, repo) = setup();
        let session = repo.create(NewSession::new("pty")).unwrap();
        let n = 64;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let recorder = Arc::clone(&recorder);
                let id = session.id.clone();
                thread::spawn(move || recorder.record_event(&id, chunk(i)).unwrap().seq)
            })
            .collect();

        let seqs: HashSet<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let expected: HashSet<i64> = (0..n as i64).collect();
        assert_eq!(seqs, expected);

        let stored = recorder.store().get_events(&session.id, FROM_START).unwrap();
        assert_eq!(stored.len(), n);
        for (i, event) in stored.iter().enumerate() {
            assert_eq!(event.seq, i as i64);
        }
    }

    #[test]
    fn test_concurrent_sessions_have_independent_sequences() {
        let (recorder, repo) = setup();
        let ids: Vec<SessionId> = (0..4)
            .map(|_| repo.create(NewSession::new("pty")).unwrap().id)
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .flat_map(|id| {
                (0..20).map(|i| {
                    let recorder = Arc::clone(&recorder);
                    let id = id.clone();
                    thread::spawn(move || recorder.record_event(&id, chunk(i)).unwrap())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for id in &ids {
            let seqs: Vec<i64> = recorder
                .store()
                .get_events(id, FROM_START)
                .unwrap()
                .iter()
                .map(|e| e.seq)
                .collect();
            assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_unknown_session_is_referential_error() {
        let (recorder, _repo) = setup();
        let ghost = SessionId::new("pty").unwrap();

        let err = recorder.record_event(&ghost, chunk(0)).unwrap_err();
        assert!(matches!(err, RelayError::Referential(_)));
        assert_eq!(recorder.store().count(&ghost).unwrap(), 0);

        // Ghost ids leave nothing cached behind
        for _ in 0..3 {
            recorder.record_event(&SessionId::new("pty").unwrap(), chunk(0)).unwrap_err();
        }
        assert_eq!(recorder.tracked(), 0);
    }

    #[test]
    fn test_resumes_from_existing_log() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let repo = SessionRepository::new(Arc::clone(&db));
        let session = repo.create(NewSession::new("pty")).unwrap();

        let first = EventRecorder::new(EventStore::new(Arc::clone(&db)));
        for _ in 0..3 {
            first.record_event(&session.id, chunk(0)).unwrap();
        }

        // A fresh recorder (e.g. after restart) continues after the stored tail
        let second = EventRecorder::new(EventStore::new(db));
        let event = second.record_event(&session.id, chunk(0)).unwrap();
        assert_eq!(event.seq, 3);
    }

    #[test]
    fn test_forget_drops_cursor() {
        let (recorder, repo) = setup();
        let session = repo.create(NewSession::new("pty")).unwrap();
        recorder.record_event(&session.id, chunk(0)).unwrap();
        assert_eq!(recorder.tracked(), 1);

        recorder.forget(&session.id);
        assert_eq!(recorder.tracked(), 0);
    }
}
