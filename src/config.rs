//! Configuration management for shell-relay.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::{AgentConfig, PromptMode, PtyConfig, PtySize};
use crate::api::ServerConfig;
use crate::cli::Args;
use crate::orchestrator::OrchestratorConfig;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub sessions: SessionsSection,
    pub pty: PtySection,
    pub agent: AgentSection,
    pub logging: LoggingSection,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Close live sessions on ctrl-c before exiting.
    pub graceful_shutdown: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            graceful_shutdown: true,
        }
    }
}

/// Storage configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite database file.
    pub database: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database: PathBuf::from("shell-relay.db"),
        }
    }
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// Seconds between graceful stop and force kill.
    pub stop_grace_secs: u64,
    /// Extra seconds before a missing closing event is injected.
    pub close_margin_secs: u64,
    /// Live events buffered per session.
    pub broadcast_capacity: usize,
    /// Adapter events buffered before producers block.
    pub pipeline_capacity: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            stop_grace_secs: defaults.stop_grace.as_secs(),
            close_margin_secs: defaults.close_margin.as_secs(),
            broadcast_capacity: defaults.broadcast_capacity,
            pipeline_capacity: defaults.pipeline_capacity,
        }
    }
}

/// PTY defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtySection {
    /// Shell to run; the platform default when unset.
    pub shell: Option<String>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySection {
    fn default() -> Self {
        let size = PtySize::default();
        Self {
            shell: None,
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// Agent CLI invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub program: String,
    pub args: Vec<String>,
    pub prompt_mode: PromptMode,
    pub resume_flag: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            program: defaults.program,
            args: defaults.args,
            prompt_mode: defaults.prompt_mode,
            resume_flag: defaults.resume_flag,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_with<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("SHELL_RELAY_HOST") {
            self.server.host = host;
        }

        if let Some(port) = var("SHELL_RELAY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Some(database) = var("SHELL_RELAY_DATABASE").filter(|d| !d.is_empty()) {
            self.storage.database = PathBuf::from(database);
        }

        if let Some(grace) = var("SHELL_RELAY_STOP_GRACE_SECS") {
            if let Ok(grace) = grace.parse() {
                self.sessions.stop_grace_secs = grace;
            }
        }

        if let Some(program) = var("SHELL_RELAY_AGENT_COMMAND").filter(|p| !p.is_empty()) {
            self.agent.program = program;
        }

        if let Some(level) = var("SHELL_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host {
            self.server.host = host.to_string();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ref database) = args.database {
            self.storage.database = database.clone();
        }
        if let Some(grace) = args.grace_secs {
            self.sessions.stop_grace_secs = grace;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env();
        config.apply_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Reject values that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.broadcast_capacity == 0 {
            return Err(ConfigError::InvalidValue("sessions.broadcast_capacity", "0".into()));
        }
        if self.sessions.pipeline_capacity == 0 {
            return Err(ConfigError::InvalidValue("sessions.pipeline_capacity", "0".into()));
        }
        if self.pty.rows == 0 || self.pty.cols == 0 {
            return Err(ConfigError::InvalidValue(
                "pty.size",
                format!("{}x{}", self.pty.cols, self.pty.rows),
            ));
        }
        if self.agent.program.trim().is_empty() {
            return Err(ConfigError::InvalidValue("agent.program", String::new()));
        }
        Ok(())
    }

    /// Convert to ServerConfig for the API server.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.server.host.clone()))?;

        let mut server_config = ServerConfig::new(host.to_string(), self.server.port);
        if !self.server.graceful_shutdown {
            server_config = server_config.without_graceful_shutdown();
        }
        Ok(server_config)
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.sessions.stop_grace_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            stop_grace: self.stop_grace(),
            close_margin: Duration::from_secs(self.sessions.close_margin_secs),
            broadcast_capacity: self.sessions.broadcast_capacity,
            pipeline_capacity: self.sessions.pipeline_capacity,
        }
    }

    pub fn pty_config(&self) -> PtyConfig {
        PtyConfig {
            shell: self.pty.shell.clone(),
            size: PtySize::new(self.pty.rows, self.pty.cols),
            stop_grace: self.stop_grace(),
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            program: self.agent.program.clone(),
            args: self.agent.args.clone(),
            prompt_mode: self.agent.prompt_mode,
            resume_flag: self.agent.resume_flag.clone(),
            stop_grace: self.stop_grace(),
        }
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Invalid host address.
    InvalidHost(String),
    /// Setting with an unusable value.
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidHost(host) => write!(f, "invalid host address: {}", host),
            Self::InvalidValue(name, value) => write!(f, "invalid value for {}: '{}'", name, value),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.database, PathBuf::from("shell-relay.db"));
        assert_eq!(config.sessions.stop_grace_secs, 5);
        assert_eq!(config.agent.program, "claude");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "server": { "host": "0.0.0.0", "port": 8080 },
            "storage": { "database": "/var/lib/relay.db" },
            "sessions": { "stop_grace_secs": 2 },
            "agent": { "program": "my-agent", "prompt_mode": "stdin", "resume_flag": null }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.database, PathBuf::from("/var/lib/relay.db"));
        assert_eq!(config.sessions.stop_grace_secs, 2);
        assert_eq!(config.sessions.broadcast_capacity, 1024);

        let agent = config.agent_config();
        assert_eq!(agent.program, "my-agent");
        assert_eq!(agent.prompt_mode, PromptMode::Stdin);
        assert!(agent.resume_flag.is_none());
        assert_eq!(agent.stop_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{ "server": { "port": 9000 } }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1"); // Default
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_malformed_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_apply_env() {
        let vars: HashMap<&str, &str> = [
            ("SHELL_RELAY_PORT", "4100"),
            ("SHELL_RELAY_DATABASE", "/tmp/env.db"),
            ("SHELL_RELAY_STOP_GRACE_SECS", "9"),
            ("SHELL_RELAY_AGENT_COMMAND", "codex"),
            ("RUST_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_with(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 4100);
        assert_eq!(config.storage.database, PathBuf::from("/tmp/env.db"));
        assert_eq!(config.sessions.stop_grace_secs, 9);
        assert_eq!(config.agent.program, "codex");
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_env_log_level_beats_rust_log() {
        let mut config = Config::default();
        config.apply_env_with(|key| match key {
            "SHELL_RELAY_LOG_LEVEL" => Some("warn".into()),
            "RUST_LOG" => Some("trace".into()),
            _ => None,
        });
        assert_eq!(config.log_filter(), "warn");
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.server.port = 4100;

        let args = Args {
            host: Some("192.168.1.1".parse().unwrap()),
            grace_secs: Some(1),
            ..Args::default()
        };
        config.apply_args(&args);

        assert_eq!(config.server.host, "192.168.1.1");
        // Unset flags keep the lower layer
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.orchestrator_config().stop_grace, Duration::from_secs(1));
        assert_eq!(config.pty_config().stop_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_to_server_config() {
        let config = Config::default();
        let server_config = config.to_server_config().unwrap();

        assert_eq!(server_config.host, "127.0.0.1");
        assert_eq!(server_config.port, 3000);
    }

    #[test]
    fn test_invalid_host() {
        let mut config = Config::default();
        config.server.host = "not-an-ip".to_string();

        let result = config.to_server_config();
        assert!(matches!(result, Err(ConfigError::InvalidHost(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.sessions.pipeline_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue("sessions.pipeline_capacity", _))
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"host\""));
        assert!(json.contains("\"stop_grace_secs\""));
        assert!(json.contains("\"prompt_mode\": \"argument\""));
    }
}
