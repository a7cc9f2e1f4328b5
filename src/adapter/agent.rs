//! Turn-based CLI agent sessions.
//!
//! Every input is one prompt. Prompts are queued and run one at a time as
//! a fresh process invocation of the configured agent CLI; the session
//! stays alive between turns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{AdapterContext, EventSink, PtySize, SessionAdapter, StartOptions};
use crate::error::RelayError;
use crate::event::{
    NewEvent, CHANNEL_AGENT_META, CHANNEL_AGENT_STDERR, CHANNEL_AGENT_STDOUT, CHANNEL_AGENT_TURN,
    TYPE_EXTERNAL_ID, TYPE_OUTPUT,
};
use crate::Result;

const PROMPT_QUEUE: usize = 32;
/// Lets stderr finish after stdout closes.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// How a prompt reaches the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Written to stdin, which is then closed.
    Stdin,
    /// Appended as the last command-line argument.
    #[default]
    Argument,
}

/// How to invoke the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub program: String,
    pub args: Vec<String>,
    pub prompt_mode: PromptMode,
    /// Flag placed before the external id on follow-up turns.
    pub resume_flag: Option<String>,
    pub stop_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".into(),
            args: vec![
                "-p".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
            ],
            prompt_mode: PromptMode::Argument,
            resume_flag: Some("--resume".into()),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Handles that exist while the turn worker runs.
struct AgentRuntime {
    prompts: mpsc::Sender<Vec<u8>>,
    cancel: watch::Sender<bool>,
}

/// Adapter for the `agent` kind.
pub struct AgentAdapter {
    context: AdapterContext,
    config: AgentConfig,
    runtime: Mutex<Option<AgentRuntime>>,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl AgentAdapter {
    pub fn new(context: AdapterContext, config: AgentConfig) -> Self {
        Self {
            context,
            config,
            runtime: Mutex::new(None),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionAdapter for AgentAdapter {
    fn kind(&self) -> &str {
        self.context.session_id.kind()
    }

    async fn start(&self, options: &StartOptions) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Start("agent already started".into()));
        }

        let program = which::which(&self.config.program).map_err(|e| {
            RelayError::Start(format!("agent program {:?} not found: {}", self.config.program, e))
        })?;

        if let Some(dir) = &options.workspace_path {
            if !dir.is_dir() {
                return Err(RelayError::Start(format!(
                    "workspace {} is not a directory",
                    dir.display()
                )));
            }
        }

        let (prompts_tx, prompts_rx) = mpsc::channel(PROMPT_QUEUE);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let worker = TurnWorker {
            program,
            args: self.config.args.clone(),
            prompt_mode: self.config.prompt_mode,
            resume_flag: self.config.resume_flag.clone(),
            cwd: options.workspace_path.clone(),
            env: options.env.clone(),
            grace: self.config.stop_grace,
            sink: self.context.sink.clone(),
            external_id: None,
            turns: 0,
        };

        {
            let mut guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
            // A stop that raced start is applied as soon as the worker runs
            if self.stopping.load(Ordering::SeqCst) {
                let _ = cancel_tx.send(true);
            }
            *guard = Some(AgentRuntime {
                prompts: prompts_tx,
                cancel: cancel_tx,
            });
        }

        info!(
            session_id = %self.context.session_id,
            program = %worker.program.display(),
            "Agent ready"
        );
        tokio::spawn(worker.run(prompts_rx, cancel_rx));
        Ok(())
    }

    async fn write_input(&self, data: &[u8]) -> Result<()> {
        let prompts = {
            let guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
            guard.as_ref().map(|rt| rt.prompts.clone())
        };

        let queued = match prompts {
            Some(tx) if !self.stopping.load(Ordering::SeqCst) => {
                tx.send(data.to_vec()).await.is_ok()
            }
            _ => false,
        };
        if !queued {
            debug!(session_id = %self.context.session_id, "Prompt for stopped agent ignored");
        }
        Ok(())
    }

    async fn resize(&self, _size: PtySize) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let signalled = {
            let guard = self.runtime.lock().map_err(|_| RelayError::LockPoisoned)?;
            match guard.as_ref() {
                Some(rt) => {
                    let _ = rt.cancel.send(true);
                    true
                }
                None => false,
            }
        };

        if !signalled && !self.started.load(Ordering::SeqCst) {
            self.context
                .sink
                .emit_closed(json!({ "reason": "not_started" }))
                .await;
        }
        Ok(())
    }
}

/// Runs queued prompts one at a time.
struct TurnWorker {
    program: PathBuf,
    args: Vec<String>,
    prompt_mode: PromptMode,
    resume_flag: Option<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    grace: Duration,
    sink: EventSink,
    external_id: Option<String>,
    turns: u64,
}

impl TurnWorker {
    async fn run(mut self, mut prompts: mpsc::Receiver<Vec<u8>>, mut cancel: watch::Receiver<bool>) {
        let mut cancelled = false;

        while !cancelled {
            let mut stop = cancel.clone();
            tokio::select! {
                prompt = prompts.recv() => match prompt {
                    Some(prompt) => cancelled = self.run_turn(prompt, &mut cancel).await,
                    None => break,
                },
                _ = stopped(&mut stop) => cancelled = true,
            }
        }

        let reason = if cancelled { "stopped" } else { "ended" };
        debug!(session_id = %self.sink.session_id(), turns = self.turns, reason, "Agent worker finished");
        self.sink
            .emit_closed(json!({ "reason": reason, "turns": self.turns }))
            .await;
    }

    fn command(&self, prompt: &[u8]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let (Some(flag), Some(id)) = (&self.resume_flag, &self.external_id) {
            cmd.arg(flag).arg(id);
        }
        match self.prompt_mode {
            PromptMode::Argument => {
                cmd.arg(String::from_utf8_lossy(prompt).into_owned());
                cmd.stdin(Stdio::null());
            }
            PromptMode::Stdin => {
                cmd.stdin(Stdio::piped());
            }
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run one prompt to completion. Returns whether the turn was cancelled.
    async fn run_turn(&mut self, prompt: Vec<u8>, cancel: &mut watch::Receiver<bool>) -> bool {
        self.turns += 1;
        let turn = self.turns;
        self.emit_turn("started", json!({ "turn": turn })).await;

        let mut child = match self.command(&prompt).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(session_id = %self.sink.session_id(), turn, "Failed to spawn agent: {}", e);
                let message = format!("failed to spawn agent: {e}");
                self.sink
                    .emit(NewEvent::new(CHANNEL_AGENT_STDERR, TYPE_OUTPUT, message))
                    .await;
                self.emit_turn(
                    "completed",
                    json!({ "turn": turn, "exitCode": null, "cancelled": false }),
                )
                .await;
                return false;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&prompt).await {
                    debug!("Agent stdin closed early: {}", e);
                }
                // Dropping stdin signals end of prompt
            });
        }

        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_lines(stderr, self.sink.clone(), CHANNEL_AGENT_STDERR)));

        let mut cancelled = false;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => self.on_stdout(line).await,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(session_id = %self.sink.session_id(), "Agent stdout error: {}", e);
                            break;
                        }
                    },
                    _ = stopped(cancel) => {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        let status = if cancelled {
            self.terminate(&mut child).await
        } else {
            child.wait().await.ok()
        };

        if let Some(task) = stderr {
            let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
        }

        let exit_code = status.and_then(|s| s.code());
        debug!(session_id = %self.sink.session_id(), turn, ?exit_code, cancelled, "Turn finished");
        self.emit_turn(
            "completed",
            json!({ "turn": turn, "exitCode": exit_code, "cancelled": cancelled }),
        )
        .await;
        cancelled
    }

    async fn on_stdout(&mut self, line: String) {
        let external_id = if self.external_id.is_none() {
            external_session_id(&line)
        } else {
            None
        };

        self.sink
            .emit(NewEvent::new(CHANNEL_AGENT_STDOUT, TYPE_OUTPUT, line))
            .await;

        if let Some(id) = external_id {
            info!(session_id = %self.sink.session_id(), external_id = %id, "Agent reported its session id");
            self.sink
                .emit(NewEvent::new(
                    CHANNEL_AGENT_META,
                    TYPE_EXTERNAL_ID,
                    json!({ "externalId": id }).to_string(),
                ))
                .await;
            self.external_id = Some(id);
        }
    }

    async fn emit_turn(&self, event_type: &str, payload: serde_json::Value) {
        self.sink
            .emit(NewEvent::new(CHANNEL_AGENT_TURN, event_type, payload.to_string()))
            .await;
    }

    /// Ask the turn to end, killing it once the grace period runs out.
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        #[cfg(unix)]
        match child.id() {
            Some(pid) => {
                // SAFETY: plain signal delivery to our own child
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            None => return child.wait().await.ok(),
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                warn!(
                    session_id = %self.sink.session_id(),
                    error = %RelayError::Timeout,
                    "Agent ignored termination, killing"
                );
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill agent: {}", e);
                }
                child.wait().await.ok()
            }
        }
    }
}

/// Resolves once a stop is requested, or the adapter is gone.
async fn stopped(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// The agent's own session id, if `line` is a JSON object reporting one.
fn external_session_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value
        .get("session_id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(String::from)
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, sink: EventSink, channel: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !sink.emit(NewEvent::new(channel, TYPE_OUTPUT, line)).await {
            break;
        }
    }
}
