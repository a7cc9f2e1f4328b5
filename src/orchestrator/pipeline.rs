//! Per-session actor: records every event, then fans it out.
//!
//! Adapter output and orchestrator control messages are handled by the
//! same task, so the order events are persisted in is the order
//! subscribers see them in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::LiveSession;
use crate::event::{
    NewEvent, SessionEvent, CHANNEL_AGENT_META, STATUS_ERROR, STATUS_RUNNING, TYPE_EXTERNAL_ID,
};
use crate::session::{SessionId, SessionRecord, SessionRepository, SessionStatus};
use crate::store::{blocking, EventRecorder};
use crate::Result;

pub(crate) type LiveMap = Arc<RwLock<HashMap<SessionId, LiveSession>>>;

/// Messages from the orchestrator to a session's pipeline.
pub(crate) enum Control {
    /// The adapter started; move to running.
    Started {
        ack: oneshot::Sender<Result<SessionRecord>>,
    },
    /// The adapter failed to start; move to error and finish.
    Failed {
        reason: String,
        ack: oneshot::Sender<()>,
    },
    /// The adapter never produced its closing event in time.
    ForceClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Finished,
}

pub(crate) struct Pipeline {
    pub id: SessionId,
    pub repository: SessionRepository,
    pub recorder: Arc<EventRecorder>,
    pub events: broadcast::Sender<SessionEvent>,
    pub live: LiveMap,
    pub done: watch::Sender<bool>,
    phase: Phase,
    /// Events that arrived before the session reached running.
    pending: Vec<NewEvent>,
}

impl Pipeline {
    pub fn new(
        id: SessionId,
        repository: SessionRepository,
        recorder: Arc<EventRecorder>,
        events: broadcast::Sender<SessionEvent>,
        live: LiveMap,
        done: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            repository,
            recorder,
            events,
            live,
            done,
            phase: Phase::Starting,
            pending: Vec::new(),
        }
    }

    pub async fn run(
        mut self,
        mut adapter_rx: mpsc::Receiver<NewEvent>,
        mut control_rx: mpsc::Receiver<Control>,
    ) {
        debug!(session_id = %self.id, "Pipeline started");

        while self.phase != Phase::Finished {
            tokio::select! {
                biased;
                Some(control) = control_rx.recv() => self.on_control(control).await,
                event = adapter_rx.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        // Every sink is gone without a closing event
                        self.on_event(NewEvent::closed(json!({ "reason": "adapter_dropped" })))
                            .await;
                        if self.phase == Phase::Starting {
                            // Wait for the orchestrator's verdict on start
                            match control_rx.recv().await {
                                Some(control) => self.on_control(control).await,
                                None => break,
                            }
                        }
                    }
                },
            }
        }

        self.finish();
    }

    async fn on_control(&mut self, control: Control) {
        match control {
            Control::Started { ack } => {
                let result = self.mark_running().await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    self.phase = Phase::Finished;
                    return;
                }
                for event in std::mem::take(&mut self.pending) {
                    self.on_event(event).await;
                }
            }
            Control::Failed { reason, ack } => {
                if let Err(e) = self.update_status(SessionStatus::Error).await {
                    warn!(session_id = %self.id, "Failed to mark session as errored: {}", e);
                }
                for event in std::mem::take(&mut self.pending) {
                    if !event.is_closed() {
                        self.publish(event).await;
                    }
                }
                self.publish(NewEvent::status(STATUS_ERROR, json!({ "reason": reason })))
                    .await;
                self.phase = Phase::Finished;
                let _ = ack.send(());
            }
            Control::ForceClose => {
                warn!(session_id = %self.id, "No closing event from adapter, closing session");
                self.on_event(NewEvent::closed(json!({ "reason": "timeout" })))
                    .await;
            }
        }
    }

    async fn mark_running(&mut self) -> Result<SessionRecord> {
        let record = self.update_status(SessionStatus::Running).await?;
        self.phase = Phase::Running;
        self.publish(NewEvent::status(
            STATUS_RUNNING,
            json!({ "kind": self.id.kind() }),
        ))
        .await;
        info!(session_id = %self.id, kind = %self.id.kind(), "Session running");
        Ok(record)
    }

    async fn on_event(&mut self, event: NewEvent) {
        match self.phase {
            Phase::Finished => {
                debug!(session_id = %self.id, channel = %event.channel, "Event after close dropped");
            }
            Phase::Starting => {
                if !(event.is_closed() && self.pending.iter().any(NewEvent::is_closed)) {
                    self.pending.push(event);
                }
            }
            _ if event.is_closed() => self.close(event).await,
            _ => {
                let external_id = external_id(&event);
                self.publish(event).await;
                if let Some(external_id) = external_id {
                    self.store_external_id(external_id).await;
                }
            }
        }
    }

    async fn close(&mut self, event: NewEvent) {
        self.publish(event).await;
        self.phase = Phase::Finished;

        let repository = self.repository.clone();
        let id = self.id.clone();
        let stopped = blocking(move || match repository.find_by_id(&id)? {
            Some(record) if record.status == SessionStatus::Running => {
                repository.update_status(&id, SessionStatus::Stopped).map(Some)
            }
            _ => Ok(None),
        })
        .await;
        if let Err(e) = stopped {
            warn!(session_id = %self.id, "Failed to mark session as stopped: {}", e);
        }
        info!(session_id = %self.id, "Session closed");
    }

    async fn update_status(&self, status: SessionStatus) -> Result<SessionRecord> {
        let repository = self.repository.clone();
        let id = self.id.clone();
        blocking(move || repository.update_status(&id, status)).await
    }

    /// Record `event`, then hand it to live subscribers.
    async fn publish(&self, event: NewEvent) {
        let recorder = Arc::clone(&self.recorder);
        let id = self.id.clone();
        match blocking(move || recorder.record_event(&id, event)).await {
            Ok(stored) => {
                // No receivers is fine
                let _ = self.events.send(stored);
            }
            Err(e) => {
                error!(session_id = %self.id, code = e.code(), "Failed to record event: {}", e);
            }
        }
    }

    async fn store_external_id(&self, external_id: String) {
        let repository = self.repository.clone();
        let id = self.id.clone();
        let result = blocking(move || {
            let Some(record) = repository.find_by_id(&id)? else {
                return Ok(());
            };
            let mut meta = match record.meta {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            meta.insert("externalId".into(), json!(external_id));
            repository.update_meta(&id, &serde_json::Value::Object(meta))
        })
        .await;
        if let Err(e) = result {
            warn!(session_id = %self.id, "Failed to store external id: {}", e);
        }
    }

    fn finish(self) {
        match self.live.write() {
            Ok(mut live) => {
                live.remove(&self.id);
            }
            Err(_) => error!(session_id = %self.id, "Live session map poisoned"),
        }
        // A later append reloads the cursor from the store
        self.recorder.forget(&self.id);
        let _ = self.done.send(true);
        debug!(session_id = %self.id, "Pipeline finished");
    }
}

fn external_id(event: &NewEvent) -> Option<String> {
    if event.channel != CHANNEL_AGENT_META || event.event_type != TYPE_EXTERNAL_ID {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(&event.payload).ok()?;
    value
        .get("externalId")
        .and_then(|v| v.as_str())
        .map(String::from)
}
