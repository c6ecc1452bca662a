//! Transport server
//!
//! Hosts a [`StoreHandle`] behind two bindings that accept the same command vocabulary:
//! a persistent length-prefixed socket and a stateless HTTP endpoint. Each accepted
//! connection runs on its own task; a failure on one connection never touches the others.
//! While the store is up a background task logs its contents at debug level.

mod http;
mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ShareError, ShareResult};
use crate::files::FileRegistry;
use crate::messages::{CallArgs, RegisteredMethod};
use crate::store::StoreHandle;
use crate::wire::{Command, Response, SHUTTING_DOWN};

pub use http::SECRET_HEADER;

/// Execute one decoded command against the store
///
/// `KILL` only produces its reply here; the binding shuts the store down after the reply has
/// been written.
pub async fn dispatch(store: &StoreHandle, command: Command) -> Response {
    debug!(command = command.name(), "dispatch: called");
    let result = match command {
        Command::Set { key, value } => store.set(key, value).await.map(|_| Response::ok(true)),
        Command::Get { key } => store
            .get(key)
            .await
            .map(|value| Response::ok(value.unwrap_or(Value::Null))),
        Command::GetMany { keys } => store
            .get_many(keys)
            .await
            .map(|found| Response::ok(found.map(Value::Object).unwrap_or(Value::Null))),
        Command::Delete { key } => store.delete(key).await.map(Response::ok),
        Command::Has { key } => store.has(key).await.map(Response::ok),
        Command::ListKeys => store.list_keys().await.map(Response::ok),
        Command::ListData => store.list_data().await.map(|items| {
            let pairs: Vec<Value> = items
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
                .collect();
            Response::ok(pairs)
        }),
        Command::Clear => store.clear().await.map(|_| Response::ok(true)),
        Command::Call { method, args, kwargs } => {
            match store.call_method(method, CallArgs { args, kwargs }).await {
                Ok(value) => Ok(Response::ok(value)),
                Err(ShareError::MethodNotFound(name)) => Ok(Response::method_not_found(&name)),
                Err(ShareError::CallFailed(message)) => Ok(Response::call_failed(message)),
                Err(e) => Err(e),
            }
        }
        Command::Register { name, event } => store
            .register_method(name.clone(), RegisteredMethod::relay(event))
            .await
            .map(|_| Response::ok(format!("REGISTERED {}", name))),
        Command::Kill => Ok(Response::ok(SHUTTING_DOWN)),
        Command::Auth { .. } => Ok(Response::ok(true)),
        Command::Unknown(name) => {
            debug!(%name, "dispatch: unknown command");
            Ok(Response::unknown_command())
        }
    };

    result.unwrap_or_else(|e| {
        warn!(error = %e, "dispatch: store error");
        Response::call_failed(e.to_string())
    })
}

/// Starts the transport bindings for a store
pub struct ShareServer;

impl ShareServer {
    /// Spawn a fresh store and serve it
    pub async fn spawn(config: &ServerConfig) -> ShareResult<ServerHandle> {
        Self::start(config, StoreHandle::spawn()).await
    }

    /// Serve an existing store on the addresses in `config`
    ///
    /// An address already taken is reported as [`ShareError::AddrInUse`], which usually means
    /// another process is hosting the store.
    pub async fn start(config: &ServerConfig, store: StoreHandle) -> ShareResult<ServerHandle> {
        debug!(?config, "ShareServer::start: called");
        let socket_listener = bind(&config.socket_addr()).await?;
        let socket_addr = socket_listener.local_addr()?;

        let http_listener = match config.http_port {
            Some(port) => Some(bind(&format!("{}:{}", config.host, port)).await?),
            None => None,
        };
        let http_addr = match &http_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let files = Arc::new(FileRegistry::new(&config.upload_dir));
        let mut tasks = vec![tokio::spawn(socket::serve(
            socket_listener,
            store.clone(),
            config.secret.clone(),
        ))];
        if let Some(listener) = http_listener {
            tasks.push(tokio::spawn(http::serve(
                listener,
                store.clone(),
                config.secret.clone(),
                files.clone(),
            )));
        }
        if let Some(period) = config.dump_interval() {
            tasks.push(tokio::spawn(log_snapshots(store.clone(), period)));
        }

        info!(%socket_addr, ?http_addr, upload_dir = %files.dir().display(), "Share server listening");
        Ok(ServerHandle {
            socket_addr,
            http_addr,
            store,
            files,
            tasks,
        })
    }
}

async fn bind(addr: &str) -> ShareResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            ShareError::AddrInUse(addr.to_string())
        } else {
            ShareError::Io(e)
        }
    })
}

/// Log the store contents every `period` until the store shuts down
async fn log_snapshots(store: StoreHandle, period: Duration) {
    let mut ticks = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = store.closed() => break,
            _ = ticks.tick() => match store.list_data().await {
                Ok(items) => {
                    debug!(entries = items.len(), "Store snapshot");
                    for (key, value) in items {
                        debug!(%key, %value, "Store snapshot entry");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "log_snapshots: store gone");
                    break;
                }
            },
        }
    }
}

/// A running server
pub struct ServerHandle {
    socket_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    store: StoreHandle,
    files: Arc<FileRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address of the socket binding
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Bound address of the HTTP binding
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// The hosted store, for in-process access and native method registration
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Files uploaded over the HTTP binding
    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn is_running(&self) -> bool {
        !self.store.is_closed()
    }

    /// Stop accepting connections and shut the store down; idempotent
    pub async fn shutdown(&self) {
        debug!("ServerHandle::shutdown: called");
        self.store.shutdown().await;
    }

    /// Synchronous best-effort shutdown for use from `Drop`
    pub fn shutdown_now(&self) {
        self.store.shutdown_now();
    }

    /// Wait until every binding has stopped
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Server task ended abnormally");
            }
        }
        info!("Share server stopped");
    }
}
