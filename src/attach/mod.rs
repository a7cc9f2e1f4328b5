//! Client attachment and fan-out.
//!
//! A [`Namespace`] scopes clients to one session kind. A [`Connection`]
//! tracks which sessions one client is attached to; dropping it detaches
//! everything without touching the sessions themselves.

mod subscription;

pub use subscription::Subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::event::SessionEvent;
use crate::orchestrator::{CreateOptions, SessionOrchestrator};
use crate::session::{validate_kind, SessionId, SessionRecord, SessionStatus};
use crate::store::{blocking, FROM_START};
use crate::Result;

/// Result of attaching: the replayed history plus the live continuation.
pub struct Attachment {
    pub record: SessionRecord,
    pub replay: Vec<SessionEvent>,
    pub subscription: Subscription,
}

/// All sessions of one kind, as seen by clients.
#[derive(Clone)]
pub struct Namespace {
    kind: String,
    orchestrator: Arc<SessionOrchestrator>,
}

impl Namespace {
    pub fn new(kind: &str, orchestrator: Arc<SessionOrchestrator>) -> Result<Self> {
        validate_kind(kind)?;
        if !orchestrator.registry().contains(kind) {
            return Err(RelayError::UnknownKind(kind.to_string()));
        }
        Ok(Self {
            kind: kind.to_string(),
            orchestrator,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Session `id`, hiding sessions of other kinds.
    pub fn session(&self, id: &SessionId) -> Result<SessionRecord> {
        match self.orchestrator.get(id)? {
            Some(record) if record.kind == self.kind => Ok(record),
            _ => Err(RelayError::SessionNotFound(id.to_string())),
        }
    }

    /// Replay events after `from_seq` and continue with live ones.
    pub async fn attach(&self, id: &SessionId, from_seq: i64) -> Result<Attachment> {
        self.session(id)?;
        let from_seq = from_seq.max(FROM_START);

        // Subscribe before reading the replay so nothing falls in between
        let live = self.orchestrator.subscribe(id)?;
        let store = self.orchestrator.events().clone();
        let session_id = id.clone();
        let replay = blocking(move || store.get_events(&session_id, from_seq)).await?;
        let record = self.session(id)?;

        let last_seq = replay.last().map_or(from_seq, |e| e.seq);
        let finished = replay.iter().any(SessionEvent::is_closed);
        debug!(
            session_id = %id,
            from_seq,
            replayed = replay.len(),
            live = live.is_some(),
            "Attached"
        );

        let subscription = Subscription::new(
            id.clone(),
            self.orchestrator.events().clone(),
            live,
            last_seq,
            finished,
        );
        Ok(Attachment {
            record,
            replay,
            subscription,
        })
    }

    /// Create a session of this namespace's kind.
    pub async fn create(&self, kind: Option<&str>, options: CreateOptions) -> Result<SessionRecord> {
        if let Some(kind) = kind {
            if kind != self.kind {
                return Err(RelayError::UnknownKind(kind.to_string()));
            }
        }
        self.orchestrator.create_session(&self.kind, options).await
    }

    /// Forward input. Returns `false` when the session is not running.
    pub async fn input(&self, id: &SessionId, data: &[u8]) -> Result<bool> {
        self.session(id)?;
        not_running_as_false(self.orchestrator.send_input(id, data).await)
    }

    /// Resize. Returns `false` when the session is not running.
    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<bool> {
        self.session(id)?;
        not_running_as_false(self.orchestrator.resize(id, cols, rows).await)
    }

    pub async fn close(&self, id: &SessionId) -> Result<SessionStatus> {
        self.session(id)?;
        Ok(self.orchestrator.close_session(id).await?.status)
    }
}

fn not_running_as_false(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(RelayError::NotRunning { id, status }) => {
            debug!(session_id = %id, %status, "Ignored request for idle session");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

struct Attached {
    last_acked: Arc<AtomicI64>,
    task: AbortHandle,
}

/// Per-client attachment state: session id → last delivered seq.
pub struct Connection {
    namespace: Namespace,
    attached: HashMap<SessionId, Attached>,
}

impl Connection {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            attached: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Start delivering `subscription` into `tx`, replacing any earlier
    /// attachment to the same session.
    pub fn forward<M, F>(&mut self, mut subscription: Subscription, tx: mpsc::Sender<M>, wrap: F)
    where
        M: Send + 'static,
        F: Fn(SessionEvent) -> M + Send + 'static,
    {
        let id = subscription.session_id().clone();
        self.detach(&id);

        let last_acked = Arc::new(AtomicI64::new(subscription.last_seq()));
        let progress = Arc::clone(&last_acked);
        let session_id = id.clone();
        let task = tokio::spawn(async move {
            loop {
                match subscription.next().await {
                    Ok(Some(event)) => {
                        let seq = event.seq;
                        if tx.send(wrap(event)).await.is_err() {
                            break;
                        }
                        progress.store(seq, Ordering::SeqCst);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session_id = %session_id, "Delivery stopped: {}", e);
                        break;
                    }
                }
            }
            debug!(session_id = %session_id, "Delivery finished");
        });

        self.attached.insert(
            id,
            Attached {
                last_acked,
                task: task.abort_handle(),
            },
        );
    }

    /// Stop delivering a session. Returns whether it was attached.
    pub fn detach(&mut self, id: &SessionId) -> bool {
        match self.attached.remove(id) {
            Some(attached) => {
                attached.task.abort();
                true
            }
            None => false,
        }
    }

    /// Last seq delivered to this client for `id`.
    pub fn last_acked(&self, id: &SessionId) -> Option<i64> {
        self.attached
            .get(id)
            .map(|a| a.last_acked.load(Ordering::SeqCst))
    }

    pub fn attached(&self) -> Vec<SessionId> {
        self.attached.keys().cloned().collect()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for (_, attached) in self.attached.drain() {
            attached.task.abort();
        }
    }
}
