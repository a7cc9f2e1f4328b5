//! API request and response types.
//!
//! Payload bytes always travel base64-encoded so binary terminal output
//! survives JSON.

use std::collections::HashMap;

use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::PtySize;
use crate::error::RelayError;
use crate::event::SessionEvent;
use crate::orchestrator::CreateOptions;
use crate::session::{SessionRecord, SessionStatus};
use crate::store::FROM_START;

fn default_kind() -> String {
    "pty".to_string()
}

fn default_from_seq() -> i64 {
    FROM_START
}

/// Request to create a new session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Session kind [default: pty].
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(flatten)]
    pub options: SessionOptions,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            options: SessionOptions::default(),
        }
    }
}

/// Start options shared by the REST and WebSocket create calls.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionOptions {
    pub owner_user_id: Option<String>,
    pub workspace_path: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Kind-specific options, e.g. `{"shell": "/bin/zsh"}` for `pty`.
    pub options: serde_json::Value,
}

impl SessionOptions {
    pub fn into_create_options(self) -> CreateOptions {
        let size = match (self.cols, self.rows) {
            (None, None) => None,
            (cols, rows) => {
                let default = PtySize::default();
                Some(PtySize::new(
                    rows.unwrap_or(default.rows),
                    cols.unwrap_or(default.cols),
                ))
            }
        };
        CreateOptions {
            owner_user_id: self.owner_user_id,
            workspace_path: self.workspace_path,
            metadata: self.metadata,
            env: self.env,
            size,
            extra: self.options,
        }
    }
}

/// Query for session listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListSessionsQuery {
    pub status: Option<SessionStatus>,
    pub owner: Option<String>,
    pub kind: Option<String>,
}

/// List sessions response.
#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    /// Total number of sessions.
    pub count: usize,
    pub sessions: Vec<SessionRecord>,
}

/// Query for event replay.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsQuery {
    /// Return events with seq greater than this; -1 for all.
    #[serde(default = "default_from_seq")]
    pub after: i64,
}

impl Default for EventsQuery {
    fn default() -> Self {
        Self {
            after: FROM_START,
        }
    }
}

/// One session event as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub session_id: String,
    pub seq: i64,
    pub channel: String,
    pub event_type: String,
    /// Base64 payload.
    pub payload: String,
    pub ts: DateTime<Utc>,
}

impl From<&SessionEvent> for WireEvent {
    fn from(event: &SessionEvent) -> Self {
        Self {
            session_id: event.session_id.to_string(),
            seq: event.seq,
            channel: event.channel.clone(),
            event_type: event.event_type.clone(),
            payload: BASE64.encode(&event.payload),
            ts: event.ts,
        }
    }
}

impl WireEvent {
    /// Decoded payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload)
    }
}

/// Event replay response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub session_id: String,
    pub events: Vec<WireEvent>,
    /// Seq of the last returned event; `after` when nothing was returned.
    pub last_seq: i64,
}

/// Input for a session. Exactly one of `data` (base64) or `text`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputRequest {
    pub data: Option<String>,
    pub text: Option<String>,
}

impl InputRequest {
    pub fn bytes(&self) -> Result<Vec<u8>, ErrorResponse> {
        match (&self.data, &self.text) {
            (Some(data), None) => decode_payload(data),
            (None, Some(text)) => Ok(text.as_bytes().to_vec()),
            _ => Err(ErrorResponse::bad_request(
                "expected exactly one of 'data' or 'text'",
            )),
        }
    }
}

/// Decode a base64 payload from a client.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, ErrorResponse> {
    BASE64
        .decode(data)
        .map_err(|e| ErrorResponse::bad_request(format!("payload is not valid base64: {}", e)))
}

/// Terminal resize request.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Generic API error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "SESSION_NOT_FOUND").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new("SESSION_NOT_FOUND", format!("Session '{}' not found", id))
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    /// HTTP status matching this error's code.
    pub fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "SESSION_NOT_FOUND" => StatusCode::NOT_FOUND,
            "UNKNOWN_KIND" | "BAD_REQUEST" => StatusCode::BAD_REQUEST,
            "NOT_RUNNING" | "INVALID_TRANSITION" | "CONFLICT" => StatusCode::CONFLICT,
            "START_FAILED" => StatusCode::UNPROCESSABLE_ENTITY,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&RelayError> for ErrorResponse {
    fn from(e: &RelayError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Messages a WebSocket client sends.
///
/// `id` is an optional correlation id echoed back on the reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Attach {
        #[serde(default)]
        id: Option<serde_json::Value>,
        session_id: String,
        #[serde(default = "default_from_seq")]
        from_seq: i64,
    },
    #[serde(rename_all = "camelCase")]
    Detach {
        #[serde(default)]
        id: Option<serde_json::Value>,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Input {
        #[serde(default)]
        id: Option<serde_json::Value>,
        session_id: String,
        /// Base64 input bytes.
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Resize {
        #[serde(default)]
        id: Option<serde_json::Value>,
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        #[serde(default)]
        id: Option<serde_json::Value>,
        session_id: String,
    },
    Create {
        #[serde(default)]
        id: Option<serde_json::Value>,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        options: SessionOptions,
    },
    Ping {
        #[serde(default)]
        id: Option<serde_json::Value>,
    },
}

/// Messages the server sends over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Attached {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        session_id: String,
        status: SessionStatus,
        events: Vec<WireEvent>,
    },
    /// A live event after the replay.
    Event(WireEvent),
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        session_id: String,
        /// `false` when the session was not running and input was dropped.
        delivered: bool,
    },
    #[serde(rename_all = "camelCase")]
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Created {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        session_id: String,
        status: SessionStatus,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
        code: String,
        message: String,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    pub fn event(event: SessionEvent) -> Self {
        Self::Event(WireEvent::from(&event))
    }

    pub fn error(id: Option<serde_json::Value>, error: ErrorResponse) -> Self {
        Self::Error {
            id,
            code: error.code,
            message: error.message,
        }
    }
}
