//! Shell sessions backed by a pseudo-terminal.
//!
//! Works with Unix PTYs and Windows ConPTY through portable-pty.

mod io;
mod native;

pub use native::default_shell;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{ChildKiller, MasterPty};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use self::io::{InputPump, OutputPump};
use self::native::{NativePty, ShellCommand, SpawnedShell};
use super::{AdapterContext, SessionAdapter, StartOptions};
use crate::error::RelayError;
use crate::Result;

/// How long the waiter lets the reader drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// How long to wait for the child after a force kill.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(2);
const INPUT_CAPACITY: usize = 64;

/// Size of a PTY in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    /// Number of rows (height).
    pub rows: u16,
    /// Number of columns (width).
    pub cols: u16,
}

impl PtySize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Defaults applied to every PTY session.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    /// Shell to run; the platform default when unset.
    pub shell: Option<String>,
    pub size: PtySize,
    /// Time between the hangup and the force kill.
    pub stop_grace: Duration,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: None,
            size: PtySize::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Handles that only exist while the child is alive.
struct PtyRuntime {
    input: mpsc::Sender<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
}

/// Adapter for the `pty` kind: one shell process per session.
pub struct PtyAdapter {
    context: AdapterContext,
    config: PtyConfig,
    runtime: Arc<Mutex<Option<PtyRuntime>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    signalled: AtomicBool,
}

impl PtyAdapter {
    pub fn new(context: AdapterContext, config: PtyConfig) -> Self {
        Self {
            context,
            config,
            runtime: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            signalled: AtomicBool::new(false),
        }
    }

    /// Process ID of the running shell.
    pub fn pid(&self) -> Option<u32> {
        self.runtime
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|rt| rt.pid))
    }

    fn command(&self, options: &StartOptions) -> ShellCommand {
        let program = options
            .extra
            .get("shell")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| self.config.shell.clone())
            .unwrap_or_else(default_shell);

        let mut command = ShellCommand::new(program, options.size.unwrap_or(self.config.size));
        command.cwd = options.workspace_path.clone();
        command.env = options.env.clone();
        command
    }

    /// Hang up the running shell and arm the force kill.
    ///
    /// Returns `false` when there is no shell to signal. Only the first
    /// call that finds one does anything.
    fn hang_up_once(&self) -> Result<bool> {
        let exited = {
            let mut guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
            let Some(rt) = guard.as_mut() else {
                return Ok(false);
            };
            if self.signalled.swap(true, Ordering::SeqCst) {
                return Ok(true);
            }
            hang_up(rt);
            rt.exited.clone()
        };

        let runtime = Arc::clone(&self.runtime);
        let sink = self.context.sink.clone();
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            let mut exited = exited;
            if wait_for_exit(&mut exited, grace).await {
                return;
            }
            warn!(
                session_id = %sink.session_id(),
                error = %RelayError::Timeout,
                "Shell ignored hangup, killing"
            );
            force_kill(&runtime);

            if wait_for_exit(&mut exited, FORCE_KILL_TIMEOUT).await {
                return;
            }
            warn!(session_id = %sink.session_id(), "Shell still alive after kill");
            sink.emit_closed(json!({ "exitCode": null, "reason": "killed" }))
                .await;
        });
        Ok(true)
    }

    fn install(&self, spawned: SpawnedShell) -> Result<()> {
        let SpawnedShell {
            master,
            mut child,
            pid,
        } = spawned;
        let reader = master
            .try_clone_reader()
            .map_err(|e| RelayError::Start(e.to_string()))?;
        let writer = master
            .take_writer()
            .map_err(|e| RelayError::Start(e.to_string()))?;
        let killer = child.clone_killer();

        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (exited_tx, exited_rx) = watch::channel(false);

        {
            let mut guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
            *guard = Some(PtyRuntime {
                input: input_tx,
                master,
                killer,
                pid,
                exited: exited_rx,
            });
        }

        let sink = self.context.sink.clone();
        let output = tokio::spawn(OutputPump::new(reader, sink.clone()).run());
        tokio::spawn(InputPump::new(writer, input_rx).run());

        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let exit_code = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => Some(status.exit_code()),
                Ok(Err(e)) => {
                    warn!(session_id = %sink.session_id(), "Failed to wait for shell: {}", e);
                    None
                }
                Err(e) => {
                    warn!(session_id = %sink.session_id(), "Shell waiter panicked: {}", e);
                    None
                }
            };
            let _ = exited_tx.send(true);

            if tokio::time::timeout(DRAIN_TIMEOUT, output).await.is_err() {
                debug!(session_id = %sink.session_id(), "Output still open after exit, closing anyway");
            }
            clear(&runtime);

            info!(session_id = %sink.session_id(), exit_code = ?exit_code, "Shell exited");
            sink.emit_closed(json!({ "exitCode": exit_code })).await;
        });

        if self.stopping.load(Ordering::SeqCst) {
            debug!(session_id = %self.context.session_id, "Stop arrived while spawning, hanging up");
            self.hang_up_once()?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionAdapter for PtyAdapter {
    fn kind(&self) -> &str {
        self.context.session_id.kind()
    }

    async fn start(&self, options: &StartOptions) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Start("PTY already started".into()));
        }

        let command = self.command(options);
        debug!(
            session_id = %self.context.session_id,
            program = %command.program,
            "Spawning shell"
        );

        let spawned = tokio::task::spawn_blocking(move || NativePty::new().spawn(&command))
            .await
            .map_err(|e| RelayError::Start(e.to_string()))?
            .map_err(|e| RelayError::Start(e.to_string()))?;

        self.install(spawned)
    }

    async fn write_input(&self, data: &[u8]) -> Result<()> {
        let input = {
            let guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
            guard.as_ref().map(|rt| rt.input.clone())
        };

        let delivered = match input {
            Some(tx) => tx.send(data.to_vec()).await.is_ok(),
            None => false,
        };
        if !delivered {
            debug!(session_id = %self.context.session_id, "Input for stopped shell ignored");
        }
        Ok(())
    }

    async fn resize(&self, size: PtySize) -> Result<()> {
        let guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
        match guard.as_ref() {
            Some(rt) => rt
                .master
                .resize(size.into())
                .map_err(|e| RelayError::Pty(e.to_string())),
            None => {
                debug!(session_id = %self.context.session_id, "Resize for stopped shell ignored");
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.hang_up_once()? {
            return Ok(());
        }

        // Still spawning: install applies the stop. Already exited: the
        // waiter owns the closing event.
        if !self.started.load(Ordering::SeqCst) {
            self.context
                .sink
                .emit_closed(json!({ "reason": "not_started" }))
                .await;
        }
        Ok(())
    }
}

/// Send SIGHUP to the shell's process group, as a closing terminal would.
#[cfg(unix)]
fn hang_up(rt: &mut PtyRuntime) {
    if let Some(pid) = rt.pid {
        // The shell leads its own session, so its pid is the group id
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGHUP) };
        if rc == 0 {
            return;
        }
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
        if rc == 0 {
            return;
        }
    }
    if let Err(e) = rt.killer.kill() {
        debug!("Failed to signal shell: {}", e);
    }
}

#[cfg(not(unix))]
fn hang_up(rt: &mut PtyRuntime) {
    if let Err(e) = rt.killer.kill() {
        debug!("Failed to signal shell: {}", e);
    }
}

fn clear(runtime: &Mutex<Option<PtyRuntime>>) {
    if let Ok(mut guard) = runtime.lock() {
        guard.take();
    }
}

fn force_kill(runtime: &Mutex<Option<PtyRuntime>>) {
    let Ok(mut guard) = runtime.lock() else {
        return;
    };
    if let Some(rt) = guard.as_mut() {
        if let Err(e) = rt.killer.kill() {
            debug!("Force kill failed: {}", e);
        }
    }
}

/// Wait up to `limit` for the waiter to report exit.
async fn wait_for_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EventSink;
    use crate::event::{NewEvent, CHANNEL_PTY_STDOUT};
    use crate::session::SessionId;

    #[test]
    fn test_pty_size_default() {
        let size = PtySize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
    }

    #[test]
    fn test_pty_size_equality() {
        assert_eq!(PtySize::new(24, 80), PtySize::default());
        assert_ne!(PtySize::new(30, 100), PtySize::default());
    }

    #[cfg(unix)]
    fn sh_adapter(grace: Duration) -> (PtyAdapter, mpsc::Receiver<NewEvent>) {
        let id = SessionId::new("pty").unwrap();
        let (sink, rx) = EventSink::channel(id.clone(), 256);
        let config = PtyConfig {
            shell: Some("/bin/sh".into()),
            size: PtySize::default(),
            stop_grace: grace,
        };
        let adapter = PtyAdapter::new(
            AdapterContext {
                session_id: id,
                sink,
            },
            config,
        );
        (adapter, rx)
    }

    /// Collect events until the closing one, returning the output text too.
    #[cfg(unix)]
    async fn drain_until_closed(rx: &mut mpsc::Receiver<NewEvent>) -> (String, Vec<NewEvent>) {
        let mut output = Vec::new();
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            if event.channel == CHANNEL_PTY_STDOUT {
                output.extend_from_slice(&event.payload);
            }
            let closed = event.is_closed();
            events.push(event);
            if closed {
                break;
            }
        }
        (String::from_utf8_lossy(&output).into_owned(), events)
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(unix)]
    async fn test_echo_then_exit_code() {
        let (adapter, mut rx) = sh_adapter(Duration::from_secs(5));
        adapter.start(&StartOptions::default()).await.unwrap();
        assert!(adapter.pid().is_some());

        adapter.write_input(b"echo relay-$((40+2))\n").await.unwrap();
        adapter.write_input(b"exit 3\n").await.unwrap();

        let (output, events) = drain_until_closed(&mut rx).await;
        assert!(output.contains("relay-42"), "output was: {output}");

        let closed = events.last().unwrap();
        assert!(closed.is_closed());
        let payload: serde_json::Value = serde_json::from_slice(&closed.payload).unwrap();
        assert_eq!(payload["exitCode"], 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(unix)]
    async fn test_stop_emits_single_closed() {
        let (adapter, mut rx) = sh_adapter(Duration::from_secs(1));
        adapter.start(&StartOptions::default()).await.unwrap();

        adapter.stop().await.unwrap();
        adapter.stop().await.unwrap();

        let (_, events) = drain_until_closed(&mut rx).await;
        assert_eq!(events.iter().filter(|e| e.is_closed()).count(), 1);

        // Nothing else arrives once the shell is gone
        drop(adapter);
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(3), rx.recv()).await
        {
            assert!(!event.is_closed());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(unix)]
    async fn test_input_after_exit_is_ignored() {
        let (adapter, mut rx) = sh_adapter(Duration::from_secs(5));
        adapter.start(&StartOptions::default()).await.unwrap();
        adapter.write_input(b"exit 0\n").await.unwrap();
        drain_until_closed(&mut rx).await;

        adapter.write_input(b"echo ignored\n").await.unwrap();
        adapter.resize(PtySize::new(40, 120)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(unix)]
    async fn test_start_twice_fails() {
        let (adapter, _rx) = sh_adapter(Duration::from_secs(1));
        adapter.start(&StartOptions::default()).await.unwrap();
        let result = adapter.start(&StartOptions::default()).await;
        assert!(matches!(result, Err(RelayError::Start(_))));
        adapter.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(unix)]
    async fn test_missing_shell_is_start_error() {
        let (adapter, _rx) = sh_adapter(Duration::from_secs(1));
        let options = StartOptions {
            extra: json!({ "shell": "/no/such/shell" }),
            ..Default::default()
        };
        let result = adapter.start(&options).await;
        assert!(matches!(result, Err(RelayError::Start(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(unix)]
    async fn test_stop_while_spawning_hangs_up() {
        let (adapter, mut rx) = sh_adapter(Duration::from_secs(1));

        let options = StartOptions::default();
        // start yields on the spawn, so stop runs before the shell is installed
        let (started, stopped) = tokio::join!(adapter.start(&options), adapter.stop());
        started.unwrap();
        stopped.unwrap();

        let (_, events) = drain_until_closed(&mut rx).await;
        let closed = events.last().unwrap();
        assert!(closed.is_closed());
        let payload: serde_json::Value = serde_json::from_slice(&closed.payload).unwrap();
        assert_ne!(payload["reason"], "not_started");
        assert!(adapter.pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_closes() {
        let id = SessionId::new("pty").unwrap();
        let (sink, mut rx) = EventSink::channel(id.clone(), 4);
        let adapter = PtyAdapter::new(
            AdapterContext {
                session_id: id,
                sink,
            },
            PtyConfig::default(),
        );

        adapter.stop().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(event.is_closed());
    }
}
