//! Procshare configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use sharestore::ServerConfig;

use crate::retry::RetryPolicy;

/// Main procshare configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the shared store lives
    pub store: ServerConfig,

    /// Event bus polling
    pub events: EventsConfig,

    /// Worker lifecycle
    pub supervisor: SupervisorConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain, then apply environment overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config = Self::load_file_chain(config_path)?;
        Ok(config.apply_env())
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .procshare.yml
        let local_config = PathBuf::from(".procshare.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/procshare/procshare.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("procshare").join("procshare.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Environment wins over files: `SHARE_*` for the store, `SHARE_LOG_LEVEL` for logging
    pub fn apply_env(mut self) -> Self {
        self.store = self.store.apply_env();
        if let Ok(level) = std::env::var("SHARE_LOG_LEVEL") {
            self.log_level = Some(level);
        }
        self
    }
}

/// Event bus polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Sleep between poll ticks of the listening loop
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Sleep between polls of a blocking `listen_once`
    #[serde(rename = "listen-retry-ms")]
    pub listen_retry_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            listen_retry_ms: 3_000,
        }
    }
}

impl EventsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn listen_retry(&self) -> Duration {
        Duration::from_millis(self.listen_retry_ms)
    }
}

/// Worker lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Connection attempts before giving up with `ConnectionExhausted`
    #[serde(rename = "connect-retries")]
    pub connect_retries: u32,

    /// Backoff unit; attempt `n` waits `base * (n + 1)`
    #[serde(rename = "backoff-base-ms")]
    pub backoff_base_ms: u64,

    /// Ping/pong rounds before giving up with `HandshakeFailed`
    #[serde(rename = "handshake-retries")]
    pub handshake_retries: u32,

    /// Wait after each ping before checking for the pong
    #[serde(rename = "handshake-delay-ms")]
    pub handshake_delay_ms: u64,

    /// How long a worker gets to exit on its own after `terminate`
    #[serde(rename = "terminate-grace-ms")]
    pub terminate_grace_ms: u64,

    /// Host the store in-process when nobody else does
    #[serde(rename = "self-host")]
    pub self_host: bool,

    /// Worker executable; defaults to the current executable
    #[serde(rename = "worker-program")]
    pub worker_program: Option<PathBuf>,

    /// Worker arguments; defaults to `["worker"]`
    #[serde(rename = "worker-args")]
    pub worker_args: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_retries: 5,
            backoff_base_ms: 1_000,
            handshake_retries: 6,
            handshake_delay_ms: 10_000,
            terminate_grace_ms: 2_000,
            self_host: true,
            worker_program: None,
            worker_args: vec!["worker".to_string()],
        }
    }
}

impl SupervisorConfig {
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_retries, Duration::from_millis(self.backoff_base_ms))
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}
