//! Session event types shared by the store, the adapters and the fan-out layer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::SessionId;

/// Channel carrying lifecycle events.
pub const CHANNEL_SYSTEM_STATUS: &str = "system:status";
/// Channel carrying raw terminal output.
pub const CHANNEL_PTY_STDOUT: &str = "pty:stdout";
/// Channel carrying agent standard output, one line per event.
pub const CHANNEL_AGENT_STDOUT: &str = "agent:stdout";
/// Channel carrying agent standard error.
pub const CHANNEL_AGENT_STDERR: &str = "agent:stderr";
/// Channel bracketing agent turns.
pub const CHANNEL_AGENT_TURN: &str = "agent:turn";
/// Channel carrying agent bookkeeping (external ids).
pub const CHANNEL_AGENT_META: &str = "agent:meta";

/// Status event type marking the end of a session.
pub const STATUS_CLOSED: &str = "closed";
/// Status event type emitted once the adapter is ready.
pub const STATUS_RUNNING: &str = "running";
/// Status event type emitted on start failure or orphan recovery.
pub const STATUS_ERROR: &str = "error";

/// Event type for plain output chunks.
pub const TYPE_OUTPUT: &str = "output";
/// Event type of the `agent:meta` event carrying the agent's own session id.
pub const TYPE_EXTERNAL_ID: &str = "external_id";

/// An event that has not been sequenced yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub channel: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl NewEvent {
    pub fn new(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    /// A `system:status` event with a JSON payload.
    pub fn status(event_type: &str, payload: serde_json::Value) -> Self {
        Self::new(CHANNEL_SYSTEM_STATUS, event_type, payload.to_string())
    }

    /// A `system:status`/`closed` event.
    pub fn closed(payload: serde_json::Value) -> Self {
        Self::status(STATUS_CLOSED, payload)
    }

    /// Whether this is the terminal `system:status`/`closed` event.
    pub fn is_closed(&self) -> bool {
        self.channel == CHANNEL_SYSTEM_STATUS && self.event_type == STATUS_CLOSED
    }
}

/// One immutable, sequenced event of a session's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: SessionId,
    /// 0-based, contiguous per session.
    pub seq: i64,
    pub channel: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub ts: DateTime<Utc>,
}

impl SessionEvent {
    pub fn is_closed(&self) -> bool {
        self.channel == CHANNEL_SYSTEM_STATUS && self.event_type == STATUS_CLOSED
    }
}
