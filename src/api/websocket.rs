//! WebSocket handler for attaching to sessions of one kind.
//!
//! A client connects to `/api/v1/ns/{kind}/ws` and may attach to any
//! number of sessions of that kind over the same socket. Each attach
//! replays history first and then streams live events.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::handlers::AppState;
use super::types::{decode_payload, ClientMessage, ErrorResponse, ServerMessage, WireEvent};
use crate::attach::{Connection, Namespace};
use crate::error::RelayError;
use crate::session::SessionId;

/// Outgoing messages buffered per socket before delivery tasks wait.
const OUTBOUND_CAPACITY: usize = 256;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Response {
    match Namespace::new(&kind, state.orchestrator.clone()) {
        Ok(namespace) => ws
            .on_upgrade(move |socket| handle_socket(socket, namespace))
            .into_response(),
        Err(e) => {
            let body = ErrorResponse::from(&e);
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    }
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, namespace: Namespace) {
    let kind = namespace.kind().to_string();
    info!(kind = %kind, "WebSocket client connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = Connection::new(namespace);

    // Process incoming messages
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => handle_message(&mut connection, msg, &out_tx).await,
            Err(e) => Some(ServerMessage::error(
                None,
                ErrorResponse::bad_request(format!("Invalid message: {}", e)),
            )),
        };

        if let Some(reply) = reply {
            if out_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    // Detach everything; sessions keep running.
    let attached = connection.attached().len();
    drop(connection);
    drop(out_tx);
    let _ = writer.await;
    info!(kind = %kind, attached, "WebSocket client disconnected");
}

fn failure(id: Option<Value>, e: RelayError) -> ServerMessage {
    ServerMessage::error(id, ErrorResponse::from(&e))
}

/// Handle one client message. Returns the direct reply, if any.
async fn handle_message(
    connection: &mut Connection,
    msg: ClientMessage,
    out_tx: &mpsc::Sender<ServerMessage>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Attach {
            id,
            session_id,
            from_seq,
        } => {
            let session = match session_id.parse::<SessionId>() {
                Ok(session) => session,
                Err(e) => return Some(failure(id, e)),
            };
            let attachment = match connection.namespace().attach(&session, from_seq).await {
                Ok(attachment) => attachment,
                Err(e) => return Some(failure(id, e)),
            };

            let attached = ServerMessage::Attached {
                id,
                session_id: session.to_string(),
                status: attachment.record.status,
                events: attachment.replay.iter().map(WireEvent::from).collect(),
            };
            // Replay goes out before any live event is forwarded.
            if out_tx.send(attached).await.is_err() {
                return None;
            }
            connection.forward(attachment.subscription, out_tx.clone(), ServerMessage::event);
            None
        }

        ClientMessage::Detach { id, session_id } => match session_id.parse::<SessionId>() {
            Ok(session) => {
                let was_attached = connection.detach(&session);
                debug!(session_id = %session, was_attached, "Detached");
                Some(ServerMessage::Ok { id, session_id })
            }
            Err(e) => Some(failure(id, e)),
        },

        ClientMessage::Input {
            id,
            session_id,
            data,
        } => {
            let session = match session_id.parse::<SessionId>() {
                Ok(session) => session,
                Err(e) => return Some(failure(id, e)),
            };
            let bytes = match decode_payload(&data) {
                Ok(bytes) => bytes,
                Err(e) => return Some(ServerMessage::error(id, e)),
            };
            match connection.namespace().input(&session, &bytes).await {
                Ok(delivered) => Some(ServerMessage::Ack {
                    id,
                    session_id,
                    delivered,
                }),
                Err(e) => Some(failure(id, e)),
            }
        }

        ClientMessage::Resize {
            id,
            session_id,
            cols,
            rows,
        } => {
            let session = match session_id.parse::<SessionId>() {
                Ok(session) => session,
                Err(e) => return Some(failure(id, e)),
            };
            if cols == 0 || rows == 0 {
                return Some(ServerMessage::error(
                    id,
                    ErrorResponse::bad_request("cols and rows must be positive"),
                ));
            }
            match connection.namespace().resize(&session, cols, rows).await {
                Ok(_) => Some(ServerMessage::Ok { id, session_id }),
                Err(e) => Some(failure(id, e)),
            }
        }

        ClientMessage::Close { id, session_id } => {
            let session = match session_id.parse::<SessionId>() {
                Ok(session) => session,
                Err(e) => return Some(failure(id, e)),
            };
            match connection.namespace().close(&session).await {
                Ok(_) => Some(ServerMessage::Ok { id, session_id }),
                Err(e) => Some(failure(id, e)),
            }
        }

        ClientMessage::Create { id, kind, options } => {
            match connection
                .namespace()
                .create(kind.as_deref(), options.into_create_options())
                .await
            {
                Ok(record) => Some(ServerMessage::Created {
                    id,
                    session_id: record.id.to_string(),
                    status: record.status,
                }),
                Err(e) => Some(failure(id, e)),
            }
        }

        ClientMessage::Ping { id } => Some(ServerMessage::Pong { id }),
    }
}
