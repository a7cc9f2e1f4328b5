//! Emission channel from an adapter into its session pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::NewEvent;
use crate::session::SessionId;

/// Where an adapter sends everything it produces.
///
/// The receiving end is drained by the orchestrator's per-session pipeline,
/// which records each event before fanning it out. The channel is bounded:
/// blocking producers (PTY reader threads) are slowed down instead of
/// growing memory when the pipeline falls behind.
#[derive(Clone)]
pub struct EventSink {
    session_id: SessionId,
    tx: mpsc::Sender<NewEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(session_id: SessionId, tx: mpsc::Sender<NewEvent>) -> Self {
        Self {
            session_id,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A sink together with its receiving end.
    pub fn channel(session_id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<NewEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(session_id, tx), rx)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Send one event. Returns `false` once the pipeline is gone.
    pub async fn emit(&self, event: NewEvent) -> bool {
        if self.tx.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "Pipeline gone, dropping event");
            return false;
        }
        true
    }

    /// Send one event from a blocking thread.
    ///
    /// Must not be called from inside the async runtime.
    pub fn emit_blocking(&self, event: NewEvent) -> bool {
        if self.tx.blocking_send(event).is_err() {
            debug!(session_id = %self.session_id, "Pipeline gone, dropping event");
            return false;
        }
        true
    }

    /// Emit the terminal `system:status`/`closed` event.
    ///
    /// Only the first call on any clone of this sink sends anything; later
    /// calls return `false`.
    pub async fn emit_closed(&self, payload: serde_json::Value) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(NewEvent::closed(payload)).await
    }

    /// Whether the terminal event has already been emitted.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
