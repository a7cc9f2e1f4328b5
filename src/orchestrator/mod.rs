//! Session lifecycle coordination.
//!
//! The orchestrator owns the live runtime handle of every started session
//! and is the only component that moves a session between statuses. Each
//! live session gets one pipeline task that records adapter output and
//! fans it out.

mod pipeline;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use self::pipeline::{Control, LiveMap, Pipeline};
use crate::adapter::{AdapterContext, AdapterRegistry, EventSink, PtySize, SessionAdapter, StartOptions};
use crate::error::RelayError;
use crate::event::{NewEvent, SessionEvent, STATUS_ERROR};
use crate::session::{
    validate_kind, NewSession, SessionFilter, SessionId, SessionRecord, SessionRepository,
    SessionStatus,
};
use crate::store::{blocking, Database, EventRecorder, EventStore};
use crate::Result;

/// Tuning knobs for session lifecycles.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Time an adapter gets between graceful stop and force kill.
    pub stop_grace: Duration,
    /// Extra time after the grace period before a closing event is injected.
    pub close_margin: Duration,
    /// Live events buffered per session for slow subscribers.
    pub broadcast_capacity: usize,
    /// Adapter events buffered before producers are slowed down.
    pub pipeline_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            close_margin: Duration::from_secs(3),
            broadcast_capacity: 1024,
            pipeline_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    /// Upper bound on how long a stop can take to produce its closing event.
    pub fn close_deadline(&self) -> Duration {
        self.stop_grace + self.close_margin
    }
}

/// Options for [`SessionOrchestrator::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub owner_user_id: Option<String>,
    pub workspace_path: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub env: HashMap<String, String>,
    pub size: Option<PtySize>,
    /// Kind-specific start options.
    pub extra: serde_json::Value,
}

/// Runtime handles of a session that has a pipeline.
#[derive(Clone)]
pub(crate) struct LiveSession {
    adapter: Arc<dyn SessionAdapter>,
    control: mpsc::Sender<Control>,
    events: broadcast::Sender<SessionEvent>,
    done: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
}

/// Coordinates repository, adapters and event recording.
pub struct SessionOrchestrator {
    repository: SessionRepository,
    recorder: Arc<EventRecorder>,
    registry: AdapterRegistry,
    config: OrchestratorConfig,
    live: LiveMap,
}

impl SessionOrchestrator {
    pub fn new(
        repository: SessionRepository,
        recorder: Arc<EventRecorder>,
        registry: AdapterRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            recorder,
            registry,
            config,
            live: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build repository and recorder over one shared database.
    pub fn with_database(
        db: Arc<Database>,
        registry: AdapterRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self::new(
            SessionRepository::new(Arc::clone(&db)),
            Arc::new(EventRecorder::new(EventStore::new(db))),
            registry,
            config,
        )
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Read access to the event log.
    pub fn events(&self) -> &EventStore {
        self.recorder.store()
    }

    fn live_session(&self, id: &SessionId) -> Result<Option<LiveSession>> {
        let live = self.live.read().map_err(|_| RelayError::LockPoisoned)?;
        Ok(live.get(id).cloned())
    }

    fn require(&self, id: &SessionId) -> Result<SessionRecord> {
        self.repository
            .find_by_id(id)?
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))
    }

    /// Create a session of `kind` and start its adapter.
    ///
    /// Returns the record with status `running`. On start failure the
    /// session is left in `error` and [`RelayError::Start`] is returned.
    pub async fn create_session(&self, kind: &str, options: CreateOptions) -> Result<SessionRecord> {
        validate_kind(kind)?;
        if !self.registry.contains(kind) {
            return Err(RelayError::UnknownKind(kind.to_string()));
        }

        let mut new = NewSession::new(kind);
        new.owner_user_id = options.owner_user_id.clone();
        new.workspace_path = options.workspace_path.clone();
        if let Some(metadata) = options.metadata.clone() {
            new.metadata = metadata;
        }
        let record = new.into_record()?;
        let id = record.id.clone();

        let (sink, adapter_rx) = EventSink::channel(id.clone(), self.config.pipeline_capacity);
        let adapter = match self.registry.create(
            kind,
            AdapterContext {
                session_id: id.clone(),
                sink,
            },
        ) {
            Ok(adapter) => adapter,
            Err(e) => {
                self.insert_record(record).await?;
                self.fail_without_pipeline(&id, &e.to_string()).await;
                return Err(RelayError::Start(e.to_string()));
            }
        };

        let (control_tx, control_rx) = mpsc::channel(8);
        let (events_tx, _) = broadcast::channel(self.config.broadcast_capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);
        let closing = Arc::new(AtomicBool::new(false));

        // Anyone who can see the row must also find its live stream
        {
            let mut live = self.live.write().map_err(|_| RelayError::LockPoisoned)?;
            live.insert(
                id.clone(),
                LiveSession {
                    adapter: Arc::clone(&adapter),
                    control: control_tx.clone(),
                    events: events_tx.clone(),
                    done: done_rx,
                    closing: Arc::clone(&closing),
                },
            );
        }
        if let Err(e) = self.insert_record(record).await {
            if let Ok(mut live) = self.live.write() {
                live.remove(&id);
            }
            return Err(e);
        }
        info!(session_id = %id, kind, "Session created");

        let pipeline = Pipeline::new(
            id.clone(),
            self.repository.clone(),
            Arc::clone(&self.recorder),
            events_tx,
            Arc::clone(&self.live),
            done_tx,
        );
        tokio::spawn(pipeline.run(adapter_rx, control_rx));

        let start_options = StartOptions {
            workspace_path: options.workspace_path.map(PathBuf::from),
            env: options.env,
            size: options.size,
            extra: options.extra,
        };

        match adapter.start(&start_options).await {
            Ok(()) => {
                let (ack, verdict) = oneshot::channel();
                control_tx
                    .send(Control::Started { ack })
                    .await
                    .map_err(|_| RelayError::ChannelClosed)?;
                let verdict = verdict.await.map_err(|_| RelayError::ChannelClosed)?;
                match &verdict {
                    Err(e) => {
                        warn!(session_id = %id, "Started session could not be marked running: {}", e);
                        let _ = adapter.stop().await;
                    }
                    Ok(_) if closing.load(Ordering::SeqCst) => {
                        // The stop sent while starting may have found nothing to stop
                        debug!(session_id = %id, "Close requested during start, stopping again");
                        if let Err(e) = adapter.stop().await {
                            warn!(session_id = %id, "Adapter stop failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                }
                verdict
            }
            Err(e) => {
                warn!(session_id = %id, kind, "Session failed to start: {}", e);
                let reason = e.to_string();
                let (ack, finished) = oneshot::channel();
                if control_tx
                    .send(Control::Failed {
                        reason: reason.clone(),
                        ack,
                    })
                    .await
                    .is_ok()
                {
                    let _ = finished.await;
                }
                Err(match e {
                    RelayError::Start(_) => e,
                    other => RelayError::Start(other.to_string()),
                })
            }
        }
    }

    async fn insert_record(&self, record: SessionRecord) -> Result<()> {
        let repository = self.repository.clone();
        blocking(move || repository.insert(&record)).await
    }

    async fn fail_without_pipeline(&self, id: &SessionId, reason: &str) {
        let repository = self.repository.clone();
        let recorder = Arc::clone(&self.recorder);
        let session_id = id.clone();
        let event = NewEvent::status(STATUS_ERROR, json!({ "reason": reason }));
        let result = blocking(move || {
            repository.update_status(&session_id, SessionStatus::Error)?;
            let recorded = recorder.record_event(&session_id, event).map(|_| ());
            recorder.forget(&session_id);
            recorded
        })
        .await;
        if let Err(e) = result {
            warn!(session_id = %id, "Failed to mark session as errored: {}", e);
        }
    }

    /// Running session's adapter, or [`RelayError::NotRunning`].
    fn running_adapter(&self, id: &SessionId) -> Result<Arc<dyn SessionAdapter>> {
        let record = self.require(id)?;
        let not_running = |status| RelayError::NotRunning {
            id: id.to_string(),
            status,
        };
        if record.status != SessionStatus::Running {
            return Err(not_running(record.status));
        }
        let live = self.live_session(id)?.ok_or_else(|| not_running(record.status))?;
        Ok(live.adapter)
    }

    /// Forward client input to a running session.
    pub async fn send_input(&self, id: &SessionId, data: &[u8]) -> Result<()> {
        let adapter = self.running_adapter(id)?;
        adapter.write_input(data).await
    }

    /// Resize a running session's terminal.
    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        let adapter = self.running_adapter(id)?;
        adapter.resize(PtySize::new(rows, cols)).await
    }

    /// Ask a session to stop.
    ///
    /// Returns once the stop is requested; the closing event moves the
    /// session to `stopped`. Stopped and errored sessions are left alone.
    pub async fn close_session(&self, id: &SessionId) -> Result<SessionRecord> {
        let record = self.require(id)?;
        let Some(live) = self.live_session(id)? else {
            debug!(session_id = %id, status = %record.status, "Close of idle session ignored");
            return Ok(record);
        };

        // Adapters ignore repeated stops, so every close reaches the adapter;
        // only the first one arms the deadline
        let first = !live.closing.swap(true, Ordering::SeqCst);
        if first {
            info!(session_id = %id, status = %record.status, "Closing session");
        } else {
            debug!(session_id = %id, "Session already closing, stopping again");
        }
        if let Err(e) = live.adapter.stop().await {
            warn!(session_id = %id, "Adapter stop failed: {}", e);
        }
        if !first {
            return Ok(record);
        }

        let deadline = self.config.close_deadline();
        let session_id = id.clone();
        let control = live.control.clone();
        let mut done = live.done.clone();
        tokio::spawn(async move {
            if !wait_done(&mut done, deadline).await {
                warn!(session_id = %session_id, error = %RelayError::Timeout, "Close deadline passed");
                let _ = control.send(Control::ForceClose).await;
            }
        });

        Ok(record)
    }

    /// Wait until the session's pipeline has finished.
    ///
    /// Returns `true` right away if the session has no pipeline.
    pub async fn wait_closed(&self, id: &SessionId, limit: Duration) -> Result<bool> {
        match self.live_session(id)? {
            Some(live) => {
                let mut done = live.done;
                Ok(wait_done(&mut done, limit).await)
            }
            None => Ok(true),
        }
    }

    pub fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        self.repository.find_by_id(id)
    }

    pub fn list(&self, filter: Option<&SessionFilter>) -> Result<Vec<SessionRecord>> {
        self.repository.find_all(filter)
    }

    /// Live event stream of a session, if it has a pipeline.
    pub fn subscribe(&self, id: &SessionId) -> Result<Option<broadcast::Receiver<SessionEvent>>> {
        Ok(self.live_session(id)?.map(|live| live.events.subscribe()))
    }

    /// Whether the session currently has a pipeline.
    pub fn is_live(&self, id: &SessionId) -> bool {
        matches!(self.live_session(id), Ok(Some(_)))
    }

    /// Stop a session if needed, then remove it and its events.
    ///
    /// Returns whether the session existed.
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        if self.live_session(id)?.is_some() {
            self.close_session(id).await?;
            let limit = self.config.close_deadline() + Duration::from_secs(1);
            if !self.wait_closed(id, limit).await? {
                warn!(session_id = %id, "Deleting session that did not close");
            }
        }

        let existed = self.repository.delete(id)?;
        self.recorder.forget(id);
        if existed {
            info!(session_id = %id, "Session deleted");
        }
        Ok(existed)
    }

    /// Mark sessions another process left `starting` or `running` as errored.
    ///
    /// Call once at startup, before serving clients.
    pub fn recover_orphans(&self) -> Result<Vec<SessionId>> {
        let mut recovered = Vec::new();
        for record in self.repository.find_all(None)? {
            if record.status.is_terminal() || self.is_live(&record.id) {
                continue;
            }
            self.repository.update_status(&record.id, SessionStatus::Error)?;
            self.recorder.record_event(
                &record.id,
                NewEvent::status(
                    STATUS_ERROR,
                    json!({ "reason": "orphaned", "previousStatus": record.status }),
                ),
            )?;
            warn!(session_id = %record.id, previous = %record.status, "Recovered orphaned session");
            recovered.push(record.id);
        }
        Ok(recovered)
    }

    /// Close every live session and wait for them, bounded.
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<SessionId> = {
            let live = self.live.read().map_err(|_| RelayError::LockPoisoned)?;
            live.keys().cloned().collect()
        };
        if ids.is_empty() {
            return Ok(());
        }

        info!(count = ids.len(), "Shutting down live sessions");
        for id in &ids {
            if let Err(e) = self.close_session(id).await {
                warn!(session_id = %id, "Close during shutdown failed: {}", e);
            }
        }

        let limit = self.config.close_deadline() + Duration::from_secs(1);
        for id in &ids {
            if !self.wait_closed(id, limit).await? {
                warn!(session_id = %id, "Session still open at shutdown");
            }
        }
        Ok(())
    }
}

async fn wait_done(done: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // A dropped sender means the pipeline is gone too
    tokio::time::timeout(limit, done.wait_for(|finished| *finished))
        .await
        .is_ok()
}
