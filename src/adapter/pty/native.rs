//! Native PTY spawning using portable-pty.

use std::collections::HashMap;
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize as NativePtySize};

use super::PtySize;
use crate::error::RelayError;
use crate::Result;

/// Get the default shell for the current platform.
pub fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
    #[cfg(windows)]
    {
        "powershell.exe".to_string()
    }
}

impl From<PtySize> for NativePtySize {
    fn from(size: PtySize) -> Self {
        NativePtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// What to run inside a new PTY.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub size: PtySize,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>, size: PtySize) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            size,
        }
    }

    fn builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// A spawned process attached to the master side of a PTY.
pub struct SpawnedShell {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub pid: Option<u32>,
}

/// Wrapper around the native PTY system.
pub struct NativePty {
    pty_system: Box<dyn portable_pty::PtySystem + Send>,
}

impl NativePty {
    /// Create a new NativePty instance.
    pub fn new() -> Self {
        Self {
            pty_system: native_pty_system(),
        }
    }

    /// Open a PTY and spawn `command` on its slave side.
    ///
    /// This blocks while the process is created; call it from a blocking
    /// context.
    pub fn spawn(&self, command: &ShellCommand) -> Result<SpawnedShell> {
        let pair = self
            .pty_system
            .openpty(command.size.into())
            .map_err(|e| RelayError::Pty(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(command.builder())
            .map_err(|e| RelayError::Pty(e.to_string()))?;

        // The reader only sees EOF once every slave handle is closed
        drop(pair.slave);

        let pid = child.process_id();
        Ok(SpawnedShell {
            master: pair.master,
            child,
            pid,
        })
    }
}

impl Default for NativePty {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_pty::ChildKiller;

    #[test]
    fn test_default_shell() {
        let shell = default_shell();
        assert!(!shell.is_empty());

        #[cfg(unix)]
        {
            // Should be a valid path or command
            assert!(shell.starts_with('/') || !shell.contains('/'));
        }

        #[cfg(windows)]
        {
            assert!(shell.ends_with(".exe"));
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_spawn_shell() {
        let pty = NativePty::new();
        let mut spawned = pty
            .spawn(&ShellCommand::new("/bin/sh", PtySize::default()))
            .unwrap();

        assert!(spawned.pid.unwrap_or(0) > 0, "PID should be positive");
        spawned.child.kill().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_spawn_missing_program_fails() {
        let pty = NativePty::new();
        let result = pty.spawn(&ShellCommand::new(
            "/definitely/not/a/shell",
            PtySize::default(),
        ));
        assert!(matches!(result, Err(RelayError::Pty(_))));
    }
}
