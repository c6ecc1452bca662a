//! CLI argument parsing for share

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "share")]
#[command(author, version, about = "Shared store and controller/worker coordination", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Talk to the HTTP binding at this URL instead of the socket
    #[arg(long, global = true)]
    pub http: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the shared store until killed
    Serve {
        /// Also serve the HTTP binding on this port
        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Run as a worker, using the environment set by the supervisor
    Worker,

    /// Launch a worker, verify it, and keep it running
    Supervise {
        /// Configuration passed to the worker (JSON)
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        duration_secs: Option<u64>,
    },

    /// Store a value (JSON, or a plain string)
    Set {
        #[arg(required = true)]
        key: String,

        #[arg(required = true)]
        value: String,
    },

    /// Read one key, or several as a batch
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Delete a key
    Del {
        #[arg(required = true)]
        key: String,
    },

    /// Check whether a key exists
    Has {
        #[arg(required = true)]
        key: String,
    },

    /// List keys
    Keys,

    /// List keys with their values
    Data,

    /// Remove every key
    Clear,

    /// Append a value to an event queue
    Fire {
        #[arg(required = true)]
        event: String,

        #[arg(required = true)]
        value: String,
    },

    /// Call a registered method
    Call {
        #[arg(required = true)]
        method: String,

        /// Positional arguments (JSON, or plain strings)
        args: Vec<String>,
    },

    /// Shut the store down
    Kill,
}

impl Command {
    /// Log file name for this invocation
    pub fn role(&self) -> &'static str {
        match self {
            Command::Serve { .. } => "serve",
            Command::Worker => "worker",
            Command::Supervise { .. } => "supervise",
            _ => "client",
        }
    }
}

/// Parse a command-line value as JSON, falling back to a plain string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value(r#"{"a": [1]}"#), json!({"a": [1]}));
        assert_eq!(parse_value("hello world"), json!("hello world"));
        assert_eq!(parse_value(r#""quoted""#), json!("quoted"));
    }

    #[test]
    fn test_parse_get_batch() {
        let cli = Cli::try_parse_from(["share", "get", "a", "b"]).unwrap();
        match cli.command {
            Command::Get { keys } => assert_eq!(keys, vec!["a".to_string(), "b".to_string()]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["share", "keys", "--log-level", "debug", "--http", "http://localhost:5000"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.http.as_deref(), Some("http://localhost:5000"));
        assert_eq!(cli.command.role(), "client");
    }

    #[test]
    fn test_supervise_defaults() {
        let cli = Cli::try_parse_from(["share", "supervise"]).unwrap();
        match cli.command {
            Command::Supervise { payload, duration_secs } => {
                assert_eq!(payload, "null");
                assert!(duration_secs.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_set_requires_value() {
        assert!(Cli::try_parse_from(["share", "set", "key"]).is_err());
    }
}
