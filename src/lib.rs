//! # shell-relay
//!
//! Session relay for interactive shells and headless CLI agents.
//!
//! Every session is backed by an adapter that runs the underlying process
//! and by an append-only event log in SQLite. Clients attach over
//! WebSocket, receive the recorded history, and then follow live output
//! without gaps or duplicates. Sessions survive client disconnects.
//!
//! ## Features
//!
//! - **Event sourcing**: per-session sequence numbers, replay from any point
//! - **Adapters**: PTY shells and turn-based CLI agents behind one trait
//! - **Fan-out**: any number of clients per session, lag repaired from storage
//! - **Lifecycle**: exactly one closing event per session, forced if needed
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use shell_relay::{
//!     AdapterRegistry, CreateOptions, Database, OrchestratorConfig, SessionOrchestrator,
//! };
//! use shell_relay::adapter::{AgentConfig, PtyConfig};
//!
//! #[tokio::main]
//! async fn main() -> shell_relay::Result<()> {
//!     shell_relay::logging::try_init().ok();
//!
//!     let db = Arc::new(Database::open_in_memory()?);
//!     let registry = AdapterRegistry::with_defaults(PtyConfig::default(), AgentConfig::default());
//!     let orchestrator =
//!         SessionOrchestrator::with_database(db, registry, OrchestratorConfig::default());
//!
//!     let session = orchestrator.create_session("pty", CreateOptions::default()).await?;
//!     orchestrator.send_input(&session.id, b"echo hello\n").await?;
//!     orchestrator.close_session(&session.id).await?;
//!
//!     for event in orchestrator.events().get_events(&session.id, -1)? {
//!         println!("{} {} {}", event.seq, event.channel, event.event_type);
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod api;
pub mod attach;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use adapter::{AdapterRegistry, SessionAdapter};
pub use attach::{Attachment, Connection, Namespace, Subscription};
pub use config::Config;
pub use error::{RelayError, Result};
pub use event::{NewEvent, SessionEvent};
pub use orchestrator::{CreateOptions, OrchestratorConfig, SessionOrchestrator};
pub use session::{SessionId, SessionRecord, SessionRepository, SessionStatus};
pub use store::{Database, EventRecorder, EventStore};
