//! Session adapters.
//!
//! An adapter drives the process behind one session kind. The orchestrator
//! only talks to adapters through [`SessionAdapter`]; how a kind produces
//! and consumes data stays inside its implementation.
//!
//! To add a new kind:
//! 1. Implement [`SessionAdapter`] for your type
//! 2. Register a factory with [`AdapterRegistry::register`]
//!
//! No orchestrator change is needed.

mod agent;
mod pty;
mod registry;
mod sink;

pub use agent::{AgentAdapter, AgentConfig, PromptMode};
pub use pty::{default_shell, PtyAdapter, PtyConfig, PtySize};
pub use registry::{AdapterFactory, AdapterRegistry};
pub use sink::EventSink;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::session::SessionId;
use crate::Result;

/// Everything an adapter is bound to when it is constructed.
#[derive(Clone)]
pub struct AdapterContext {
    pub session_id: SessionId,
    /// Output channel, wired into the pipeline before `start` is called.
    pub sink: EventSink,
}

/// Options passed to [`SessionAdapter::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Working directory for the underlying process.
    pub workspace_path: Option<PathBuf>,
    /// Extra environment for the process.
    pub env: HashMap<String, String>,
    /// Initial terminal size (terminal kinds only).
    pub size: Option<PtySize>,
    /// Kind-specific options as sent by the client.
    pub extra: serde_json::Value,
}

/// Capability contract implemented once per session kind.
///
/// One adapter instance serves exactly one session, so the session id is
/// bound at construction through [`AdapterContext`] instead of being passed
/// to every call. All output goes through the context's [`EventSink`];
/// adapters never write to the event store themselves.
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    /// Kind this adapter implements.
    fn kind(&self) -> &str;

    /// Start the underlying process. Resolves once input can be accepted.
    ///
    /// Failures are reported as [`RelayError::Start`](crate::RelayError::Start).
    async fn start(&self, options: &StartOptions) -> Result<()>;

    /// Forward client input. A stopped adapter logs and ignores the call.
    async fn write_input(&self, data: &[u8]) -> Result<()>;

    /// Resize the terminal. Non-terminal kinds ignore this.
    async fn resize(&self, size: PtySize) -> Result<()>;

    /// Request graceful termination.
    ///
    /// Returns once the request is issued. The adapter escalates to a force
    /// kill after its grace period and always ends with exactly one
    /// `system:status`/`closed` event.
    async fn stop(&self) -> Result<()>;
}
