//! Store server configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default port of the framed socket binding
pub const DEFAULT_PORT: u16 = 50000;

/// Default host for both bindings
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default directory for files uploaded over HTTP
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

/// Default period of the store snapshot log
pub const DEFAULT_DUMP_INTERVAL_MS: u64 = 60_000;

/// Where the store lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host the store binds to / clients connect to
    pub host: String,

    /// Port of the framed socket binding (0 picks an ephemeral port when serving)
    pub port: u16,

    /// Port of the HTTP binding; disabled when unset
    #[serde(rename = "http-port")]
    pub http_port: Option<u16>,

    /// Optional shared secret required from every client
    pub secret: Option<String>,

    /// Directory backing the HTTP file registry; created on first upload
    #[serde(rename = "upload-dir")]
    pub upload_dir: PathBuf,

    /// Period of the debug-level store snapshot log; 0 disables it
    #[serde(rename = "dump-interval-ms")]
    pub dump_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            http_port: None,
            secret: None,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            dump_interval_ms: DEFAULT_DUMP_INTERVAL_MS,
        }
    }
}

impl ServerConfig {
    /// Config for an ephemeral socket-only server on localhost
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    /// Override fields from `SHARE_HOST`, `SHARE_PORT`, `SHARE_HTTP_PORT`, `SHARE_SECRET`
    /// and `SHARE_UPLOAD_DIR`
    pub fn apply_env(mut self) -> Self {
        if let Ok(host) = std::env::var("SHARE_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("SHARE_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(e) => warn!(%port, error = %e, "Ignoring invalid SHARE_PORT"),
            }
        }
        if let Ok(port) = std::env::var("SHARE_HTTP_PORT") {
            match port.parse() {
                Ok(port) => self.http_port = Some(port),
                Err(e) => warn!(%port, error = %e, "Ignoring invalid SHARE_HTTP_PORT"),
            }
        }
        if let Ok(secret) = std::env::var("SHARE_SECRET") {
            self.secret = Some(secret);
        }
        if let Ok(dir) = std::env::var("SHARE_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        self
    }

    /// `host:port` of the socket binding
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Snapshot log period, `None` when disabled
    pub fn dump_interval(&self) -> Option<Duration> {
        (self.dump_interval_ms > 0).then(|| Duration::from_millis(self.dump_interval_ms))
    }

    /// Base URL of the HTTP binding, if enabled
    pub fn http_url(&self) -> Option<String> {
        self.http_port.map(|port| format!("http://{}:{}", self.host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        // SAFETY: tests touching the environment are serialized
        unsafe {
            std::env::remove_var("SHARE_HOST");
            std::env::remove_var("SHARE_PORT");
            std::env::remove_var("SHARE_HTTP_PORT");
            std::env::remove_var("SHARE_SECRET");
            std::env::remove_var("SHARE_UPLOAD_DIR");
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 50000);
        assert_eq!(config.socket_addr(), "127.0.0.1:50000");
        assert!(config.http_url().is_none());
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.dump_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_dump_interval_disables_snapshots() {
        let config = ServerConfig {
            dump_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.dump_interval(), None);
    }

    #[test]
    #[serial]
    fn test_apply_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("SHARE_HOST", "flask-app");
            std::env::set_var("SHARE_PORT", "6000");
            std::env::set_var("SHARE_HTTP_PORT", "5000");
            std::env::set_var("SHARE_SECRET", "s3cret");
            std::env::set_var("SHARE_UPLOAD_DIR", "/var/lib/share/uploads");
        }

        let config = ServerConfig::default().apply_env();
        assert_eq!(config.host, "flask-app");
        assert_eq!(config.port, 6000);
        assert_eq!(config.http_url().as_deref(), Some("http://flask-app:5000"));
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.upload_dir, PathBuf::from("/var/lib/share/uploads"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_apply_env_ignores_bad_port() {
        clear_env();
        unsafe {
            std::env::set_var("SHARE_PORT", "not-a-port");
        }
        let config = ServerConfig::default().apply_env();
        assert_eq!(config.port, DEFAULT_PORT);
        clear_env();
    }
}
