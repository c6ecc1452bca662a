//! Procshare - controller/worker process coordination over a shared store
//!
//! Two or more processes that cannot share memory coordinate through one
//! [`sharestore`] instance: named event queues, relayed method calls, and a supervisor
//! that launches, verifies and tears down a worker process.
//!
//! # Modules
//!
//! - [`events`] - polling event bus (fire, listen, listen once, served methods)
//! - [`retry`] - bounded linear backoff
//! - [`supervisor`] - controller side: self-hosting, launch, handshake, termination
//! - [`worker`] - worker side: handshake responder and terminate handling
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod events;
pub mod retry;
pub mod supervisor;
pub mod worker;

pub use config::{Config, EventsConfig, SupervisorConfig};
pub use events::{EventBus, EventHandler, ListenMode, MethodHandler, Once, handler, method_handler};
pub use retry::RetryPolicy;
pub use supervisor::{Launch, ProcessHandle, Supervisor, WorkerState};
pub use worker::Worker;

/// Event fired by the supervisor to ask the worker to exit
pub const TERMINATE_EVENT: &str = "terminate";

/// Key the supervisor pings the worker through
pub const TEST_CONNECTION_KEY: &str = "test_connection";

/// Key the worker answers on
pub const ACK_CONNECTION_KEY: &str = "ack_connection";

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
