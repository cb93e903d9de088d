//! Configuration loading.
//!
//! Settings come from three layers, later ones winning:
//! the config file, `AGENT_BRIDGE_*` environment variables, then command-line
//! flags (applied by `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::backend::BackendSpec;
use crate::constants::{DEFAULT_BACKEND_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Configuration for the agent bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Fixed socket path. When unset a private temporary directory is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Backend requests are forwarded to.
    pub backend: BackendSpec,
    /// Maximum number of simultaneously served clients.
    pub max_connections: usize,
    /// Seconds a single backend exchange may take.
    pub backend_timeout_secs: u64,
    /// Log file, needed to see logs from a detached bridge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            backend: BackendSpec::None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backend_timeout_secs: DEFAULT_BACKEND_TIMEOUT.as_secs(),
            log_file: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// Directory selection priority:
    /// 1. `AGENT_BRIDGE_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/agent-bridge)
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("AGENT_BRIDGE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("agent-bridge"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file means defaults; a file that exists but does not parse
    /// is an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `AGENT_BRIDGE_*` overrides looked up through `var`.
    ///
    /// Malformed numbers and backend specs are errors rather than being
    /// silently ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("AGENT_BRIDGE_SOCKET").filter(|p| !p.is_empty()) {
            self.socket_path = Some(PathBuf::from(path));
        }

        if let Some(backend) = var("AGENT_BRIDGE_BACKEND") {
            self.backend = backend
                .parse()
                .context("Invalid AGENT_BRIDGE_BACKEND")?;
        }

        if let Some(max) = var("AGENT_BRIDGE_MAX_CONNECTIONS") {
            self.max_connections = max
                .trim()
                .parse()
                .with_context(|| format!("Invalid AGENT_BRIDGE_MAX_CONNECTIONS: {max:?}"))?;
        }

        if let Some(timeout) = var("AGENT_BRIDGE_BACKEND_TIMEOUT") {
            self.backend_timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("Invalid AGENT_BRIDGE_BACKEND_TIMEOUT: {timeout:?}"))?;
        }

        if let Some(log_file) = var("AGENT_BRIDGE_LOG_FILE").filter(|p| !p.is_empty()) {
            self.log_file = Some(PathBuf::from(log_file));
        }

        Ok(())
    }

    /// Backend exchange timeout as a [`Duration`].
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}
