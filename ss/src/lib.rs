//! ShareStore - in-memory key/value store shared between processes
//!
//! One process hosts the store; every other process reaches it through a small command
//! vocabulary carried over either a framed TCP socket or HTTP.
//!
//! # Architecture
//!
//! ```text
//! StoreClient ──► Transport ──► ShareServer ──► StoreHandle ──► Store actor
//!   (typed)      (socket|http)   (bindings)      (mpsc/oneshot)   (map + methods)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sharestore::{ServerConfig, ShareServer, StoreClient};
//!
//! let server = ShareServer::spawn(&ServerConfig::ephemeral()).await?;
//! let client = StoreClient::new(&ServerConfig { port: server.socket_addr().port(), ..Default::default() });
//! client.set_data("greeting", serde_json::json!("hello")).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod files;
pub mod messages;
pub mod server;
pub mod store;
pub mod wire;

pub use client::{CallOutcome, HttpTransport, SocketTransport, StoreClient, Transport};
pub use config::ServerConfig;
pub use error::{ShareError, ShareResult};
pub use files::{FileRegistry, StoredFile};
pub use messages::{CallArgs, RegisteredMethod};
pub use server::{ServerHandle, ShareServer, dispatch};
pub use store::{Store, StoreHandle, append_to_queue};
pub use wire::{Command, Response, Status};
