//! Shared fixtures for integration tests.
//!
//! `ScriptedAdapter` is an in-process adapter for the `echo` kind whose
//! behavior is driven by the start options, so lifecycle tests do not
//! depend on a shell being installed.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use shell_relay::adapter::{AdapterContext, PtySize, StartOptions};
use shell_relay::event::{NewEvent, TYPE_OUTPUT};
use shell_relay::store::{Database, EventRecorder, EventStore};
use shell_relay::{
    AdapterRegistry, OrchestratorConfig, RelayError, SessionAdapter, SessionOrchestrator,
    SessionRepository,
};

pub const ECHO_KIND: &str = "echo";
pub const ECHO_CHANNEL: &str = "echo:stdout";

/// Adapter whose start options script what it does.
///
/// - `{"fail": true}`: start fails
/// - `{"burst": N}`: emit N output events before start returns
/// - `{"closeOnStart": true}`: emit the closing event before start returns
/// - `{"hangOnStop": true}`: ignore stop requests
/// - `{"startDelayMs": N}`: take N ms to start, ignoring stops meanwhile
pub struct ScriptedAdapter {
    context: AdapterContext,
    closed: AtomicBool,
    hang_on_stop: AtomicBool,
    starting: AtomicBool,
    stops: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(context: AdapterContext) -> Self {
        Self {
            context,
            closed: AtomicBool::new(false),
            hang_on_stop: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    async fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.context.sink.emit_closed(json!({ "reason": reason })).await;
        }
    }
}

#[async_trait]
impl SessionAdapter for ScriptedAdapter {
    fn kind(&self) -> &str {
        ECHO_KIND
    }

    async fn start(&self, options: &StartOptions) -> shell_relay::Result<()> {
        let extra = &options.extra;
        if extra["fail"].as_bool() == Some(true) {
            return Err(RelayError::Start("scripted failure".into()));
        }
        if extra["hangOnStop"].as_bool() == Some(true) {
            self.hang_on_stop.store(true, Ordering::SeqCst);
        }
        if let Some(count) = extra["burst"].as_u64() {
            for i in 0..count {
                let line = format!("line-{}", i);
                self.context
                    .sink
                    .emit(NewEvent::new(ECHO_CHANNEL, TYPE_OUTPUT, line))
                    .await;
            }
        }
        if let Some(delay) = extra["startDelayMs"].as_u64() {
            self.starting.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.starting.store(false, Ordering::SeqCst);
        }
        if extra["closeOnStart"].as_bool() == Some(true) {
            self.close("exited").await;
        }
        Ok(())
    }

    async fn write_input(&self, data: &[u8]) -> shell_relay::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.context
            .sink
            .emit(NewEvent::new(ECHO_CHANNEL, TYPE_OUTPUT, data.to_vec()))
            .await;
        Ok(())
    }

    async fn resize(&self, _size: PtySize) -> shell_relay::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> shell_relay::Result<()> {
        if self.starting.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.hang_on_stop.load(Ordering::SeqCst) {
            self.close("stopped").await;
        }
        Ok(())
    }
}

pub fn echo_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry
        .register(ECHO_KIND, |context| {
            Ok(Arc::new(ScriptedAdapter::new(context)) as Arc<dyn SessionAdapter>)
        })
        .unwrap();
    registry
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        stop_grace: Duration::from_millis(100),
        close_margin: Duration::from_millis(200),
        ..Default::default()
    }
}

/// Everything an orchestrator test needs, sharing one in-memory database.
pub struct Harness {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub recorder: Arc<EventRecorder>,
    pub repository: SessionRepository,
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let repository = SessionRepository::new(Arc::clone(&db));
    let recorder = Arc::new(EventRecorder::new(EventStore::new(db)));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        repository.clone(),
        Arc::clone(&recorder),
        echo_registry(),
        config,
    ));
    Harness {
        orchestrator,
        recorder,
        repository,
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub const WAIT: Duration = Duration::from_secs(5);
