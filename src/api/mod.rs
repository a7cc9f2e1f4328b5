//! API layer for shell-relay.
//!
//! This module provides REST API and WebSocket endpoints over the
//! session orchestrator.
//!
//! ## Endpoints
//!
//! ### Health & Info
//! - `GET /health` - Health check
//! - `GET /api/v1/` - API information and registered kinds
//!
//! ### Sessions
//! - `GET /api/v1/sessions` - List sessions (`?status=&owner=&kind=`)
//! - `POST /api/v1/sessions` - Create and start a session
//! - `GET /api/v1/sessions/{id}` - Get a session
//! - `DELETE /api/v1/sessions/{id}` - Close and delete a session
//! - `GET /api/v1/sessions/{id}/events?after=N` - Replay events
//! - `POST /api/v1/sessions/{id}/input` - Send input
//! - `POST /api/v1/sessions/{id}/resize` - Resize the terminal
//! - `POST /api/v1/sessions/{id}/close` - Request a graceful stop
//!
//! ### Streaming
//! - `WS /api/v1/ns/{kind}/ws` - Attach to sessions of one kind
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shell_relay::api::{serve, AppState, ServerConfig};
//! use shell_relay::orchestrator::SessionOrchestrator;
//!
//! async fn run(orchestrator: Arc<SessionOrchestrator>) -> shell_relay::Result<()> {
//!     let config = ServerConfig::new("127.0.0.1", 3000);
//!     serve(config, AppState::new(orchestrator), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod handlers;
pub mod router;
pub mod types;
pub mod websocket;

// Re-export commonly used types
pub use handlers::AppState;
pub use router::{create_router, serve, ServerConfig};
pub use types::{
    ClientMessage, CreateSessionRequest, ErrorResponse, EventsResponse, ListSessionsResponse,
    ServerMessage, SessionOptions, WireEvent,
};
