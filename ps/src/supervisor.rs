//! Process Supervisor - the controller side of a supervised pair
//!
//! Connects to the shared store (hosting it in-process when nobody else does), launches
//! the worker as a child process, verifies it with a ping/pong handshake and tears it
//! down again.
//!
//! # Worker lifecycle
//!
//! ```text
//! Absent ──launch──► Launching ──spawned──► Connecting ──pong──► Verified
//!                                                │                  │
//!                                        no pong │       terminate  │
//!                                                ▼                  ▼
//!                                           Terminating ────────► Terminated
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};
use sharestore::{ServerConfig, ServerHandle, ShareError, ShareResult, ShareServer, StoreClient};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::EventBus;
use crate::worker::{ENV_WORKER_CONFIG, ENV_WORKER_ID};
use crate::{ACK_CONNECTION_KEY, PING, PONG, TERMINATE_EVENT, TEST_CONNECTION_KEY};

/// How long a SIGTERM gets before the hard kill
const SIGTERM_GRACE: Duration = Duration::from_millis(500);

/// Where a supervised worker is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Absent,
    Launching,
    Connecting,
    Verified,
    Terminating,
    Terminated,
}

/// Outcome of [`Supervisor::launch_client_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// A live worker exists and `force` was not set
    AlreadyRunning,
    /// A new worker was launched and verified
    Launched,
}

/// Address to connect to: the hosted server's real port when hosting, else as configured
fn effective_store(wanted: &ServerConfig, hosted: Option<&ServerHandle>) -> ServerConfig {
    match hosted {
        Some(server) => ServerConfig {
            port: server.socket_addr().port(),
            ..wanted.clone()
        },
        None => wanted.clone(),
    }
}

/// A launched worker process
#[derive(Debug)]
pub struct ProcessHandle {
    /// Launch id, also passed to the worker
    pub id: String,
    pub pid: Option<u32>,
    pub state: WorkerState,
    child: Child,
}

impl ProcessHandle {
    /// Whether the OS process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Controller-side lifecycle manager
pub struct Supervisor {
    config: Config,
    bus: EventBus,
    hosted: Option<ServerHandle>,
    worker: Option<ProcessHandle>,
    last_state: WorkerState,
    cleaned_up: bool,
}

impl Supervisor {
    /// Connect to the store, hosting it first if allowed and nobody else does
    ///
    /// Attempt `n` that fails waits `backoff_base * (n + 1)`; running out of attempts is
    /// [`ShareError::ConnectionExhausted`].
    pub async fn start(mut config: Config) -> ShareResult<Self> {
        debug!(store = %config.store.socket_addr(), self_host = config.supervisor.self_host, "Supervisor::start: called");
        let policy = config.supervisor.connect_policy();
        let self_host = config.supervisor.self_host;
        let hosted: AsyncMutex<Option<ServerHandle>> = AsyncMutex::new(None);

        let connected = {
            let (hosted, wanted) = (&hosted, &config.store);
            policy
                .run(|attempt| async move {
                    let mut hosted = hosted.lock().await;
                    let target = effective_store(wanted, hosted.as_ref());
                    let error = match StoreClient::new(&target).ping().await {
                        Ok(()) => return Ok(target),
                        Err(e) if e.is_retryable() && self_host && hosted.is_none() => e,
                        Err(e) => return Err(e),
                    };

                    warn!(attempt = attempt + 1, error = %error, "Store not reachable, trying to host it");
                    match ShareServer::spawn(wanted).await {
                        Ok(server) => {
                            info!(addr = %server.socket_addr(), "Hosting shared store in-process");
                            let target = effective_store(wanted, Some(&server));
                            *hosted = Some(server);
                            StoreClient::new(&target).ping().await.map(|()| target)
                        }
                        Err(ShareError::AddrInUse(addr)) => {
                            debug!(%addr, "Supervisor::start: address taken, another process is hosting");
                            Err(error)
                        }
                        Err(e) => Err(e),
                    }
                })
                .await
        };

        let hosted = hosted.into_inner();
        let store = match connected {
            Ok(store) => store,
            Err(e) => {
                if let Some(server) = hosted {
                    server.shutdown().await;
                }
                error!(error = %e, "Could not connect to the shared store");
                return Err(e);
            }
        };

        // Port 0 means the OS picked one; workers need the real port
        config.store = store;
        let client = StoreClient::new(&config.store);
        info!(endpoint = %client.endpoint(), hosting = hosted.is_some(), "Supervisor connected to store");
        let bus = EventBus::with_config(client, &config.events);
        Ok(Self {
            config,
            bus,
            hosted,
            worker: None,
            last_state: WorkerState::Absent,
            cleaned_up: false,
        })
    }

    /// Effective store address (with the real port when self-hosted on port 0)
    pub fn store_config(&self) -> &ServerConfig {
        &self.config.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn client(&self) -> &StoreClient {
        self.bus.client()
    }

    /// Whether this process hosts the store
    pub fn is_hosting(&self) -> bool {
        self.hosted.is_some()
    }

    pub fn worker(&self) -> Option<&ProcessHandle> {
        self.worker.as_ref()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.as_ref().map(|handle| handle.state).unwrap_or(self.last_state)
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(?state, "set_state: worker state changed");
        match self.worker.as_mut() {
            Some(handle) => handle.state = state,
            None => self.last_state = state,
        }
    }

    /// Whether a launched worker process is still running
    pub fn worker_alive(&mut self) -> bool {
        self.worker.as_mut().is_some_and(|handle| handle.is_alive())
    }

    /// Launch a worker with `payload` and verify it
    ///
    /// Without `force` a live worker is left alone. Otherwise any existing worker is
    /// terminated first. A failed handshake tears the new worker down before returning
    /// [`ShareError::HandshakeFailed`].
    pub async fn launch_client_process(&mut self, payload: &Value, force: bool) -> ShareResult<Launch> {
        debug!(force, "launch_client_process: called");
        if !force && self.worker_alive() {
            info!("Worker already running");
            return Ok(Launch::AlreadyRunning);
        }
        if self.worker.is_some() {
            self.terminate_client_process().await?;
        }

        // Stale keys from an earlier worker would end or fake-verify the new one
        for key in [TERMINATE_EVENT, TEST_CONNECTION_KEY, ACK_CONNECTION_KEY] {
            self.client().delete_data(key).await?;
        }

        let id = Uuid::now_v7().to_string();
        self.last_state = WorkerState::Launching;
        let child = match self.spawn_worker(&id, payload) {
            Ok(child) => child,
            Err(e) => {
                self.last_state = WorkerState::Absent;
                return Err(e);
            }
        };
        let pid = child.id();
        info!(%id, ?pid, "Launched worker process");
        self.worker = Some(ProcessHandle {
            id,
            pid,
            state: WorkerState::Launching,
            child,
        });

        self.set_state(WorkerState::Connecting);
        match self.verify_connection().await {
            Ok(()) => {
                self.set_state(WorkerState::Verified);
                Ok(Launch::Launched)
            }
            Err(e) => {
                error!(error = %e, "Worker failed verification, tearing it down");
                if let Err(teardown) = self.terminate_client_process().await {
                    warn!(error = %teardown, "Teardown after failed handshake also failed");
                }
                Err(e)
            }
        }
    }

    fn spawn_worker(&self, id: &str, payload: &Value) -> ShareResult<Child> {
        let program = self.worker_program()?;
        debug!(program = %program.display(), args = ?self.config.supervisor.worker_args, "spawn_worker: called");

        let store = &self.config.store;
        let mut command = Command::new(&program);
        command
            .args(&self.config.supervisor.worker_args)
            .env(ENV_WORKER_CONFIG, serde_json::to_string(payload)?)
            .env(ENV_WORKER_ID, id)
            .env("SHARE_HOST", &store.host)
            .env("SHARE_PORT", store.port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match &store.secret {
            Some(secret) => command.env("SHARE_SECRET", secret),
            None => command.env_remove("SHARE_SECRET"),
        };

        command.spawn().map_err(|e| {
            error!(program = %program.display(), error = %e, "Failed to spawn worker");
            ShareError::Io(e)
        })
    }

    /// Ping/pong liveness check
    ///
    /// Sets `test_connection` to `"ping"`, waits, and looks for `ack_connection == "pong"`;
    /// repeated up to the configured number of rounds. Success clears the ack key.
    pub async fn verify_connection(&mut self) -> ShareResult<()> {
        let rounds = self.config.supervisor.handshake_retries.max(1);
        let delay = self.config.supervisor.handshake_delay();
        debug!(rounds, ?delay, "verify_connection: called");

        for round in 0..rounds {
            self.client().set_data(TEST_CONNECTION_KEY, json!(PING)).await?;
            tokio::time::sleep(delay).await;

            if self.client().get_data(ACK_CONNECTION_KEY).await? == Some(json!(PONG)) {
                // An unanswered ping from a later round would re-set the ack
                self.client().delete_data(TEST_CONNECTION_KEY).await?;
                self.client().delete_data(ACK_CONNECTION_KEY).await?;
                info!(round = round + 1, "Worker verified");
                return Ok(());
            }

            if self.worker.is_some() && !self.worker_alive() {
                warn!("Worker exited before answering the handshake");
                break;
            }
            debug!(round = round + 1, "verify_connection: no pong yet");
        }

        Err(ShareError::HandshakeFailed { attempts: rounds })
    }

    /// Ask the worker to exit, then make sure it has
    ///
    /// Fires `terminate`, gives the worker the configured grace period, then sends SIGTERM
    /// and finally kills and reaps it.
    pub async fn terminate_client_process(&mut self) -> ShareResult<()> {
        let Some(mut handle) = self.worker.take() else {
            debug!("terminate_client_process: no worker");
            return Ok(());
        };
        info!(id = %handle.id, pid = ?handle.pid, "Terminating worker");
        handle.state = WorkerState::Terminating;

        if let Err(e) = self.bus.fire_event(TERMINATE_EVENT, json!(true)).await {
            warn!(error = %e, "Failed to fire terminate event");
        }

        let grace = self.config.supervisor.terminate_grace();
        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Worker exited on its own"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for worker"),
            Err(_) => force_stop(&mut handle).await,
        }

        // A worker that died without draining it must not leave `terminate` for the next one
        if let Err(e) = self.client().delete_data(TERMINATE_EVENT).await {
            debug!(error = %e, "terminate_client_process: could not clear terminate event");
        }

        self.last_state = WorkerState::Terminated;
        Ok(())
    }

    /// Terminate the worker and shut down the hosted store; safe to call repeatedly
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            debug!("cleanup: already done");
            return;
        }
        info!("Supervisor cleaning up");
        if let Err(e) = self.terminate_client_process().await {
            warn!(error = %e, "Failed to terminate worker during cleanup");
        }
        self.bus.shutdown().await;
        if let Some(server) = self.hosted.take() {
            server.shutdown().await;
            if tokio::time::timeout(Duration::from_secs(5), server.wait()).await.is_err() {
                warn!("Hosted store did not stop in time");
            }
        }
        self.cleaned_up = true;
    }

    /// Program that will be launched as the worker
    pub fn worker_program(&self) -> ShareResult<PathBuf> {
        match &self.config.supervisor.worker_program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        if let Some(handle) = self.worker.as_mut() {
            warn!(id = %handle.id, "Supervisor dropped without cleanup, killing worker");
            let _ = handle.child.start_kill();
        }
        if let Some(server) = &self.hosted {
            server.shutdown_now();
        }
    }
}

/// SIGTERM, a short wait, then SIGKILL; always reaps
async fn force_stop(handle: &mut ProcessHandle) {
    #[cfg(unix)]
    if let Some(pid) = handle.pid {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        debug!(pid, "force_stop: sending SIGTERM");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "force_stop: SIGTERM failed");
        }
        if let Ok(Ok(status)) = tokio::time::timeout(SIGTERM_GRACE, handle.child.wait()).await {
            info!(%status, "Worker stopped after SIGTERM");
            return;
        }
    }

    warn!(pid = ?handle.pid, "Killing worker");
    if let Err(e) = handle.child.kill().await {
        warn!(error = %e, "Failed to kill worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(port: u16) -> Config {
        let mut config = Config::default();
        config.store = ServerConfig {
            port,
            ..ServerConfig::default()
        };
        config.supervisor.connect_retries = 3;
        config.supervisor.backoff_base_ms = 10;
        config.supervisor.handshake_retries = 2;
        config.supervisor.handshake_delay_ms = 20;
        config.supervisor.terminate_grace_ms = 100;
        config
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_self_hosts_when_absent() {
        let mut supervisor = Supervisor::start(fast_config(0)).await.unwrap();
        assert!(supervisor.is_hosting());
        assert_ne!(supervisor.store_config().port, 0);
        assert_eq!(supervisor.worker_state(), WorkerState::Absent);

        supervisor.client().set_data("k", json!(1)).await.unwrap();
        assert_eq!(supervisor.client().get_data("k").await.unwrap(), Some(json!(1)));
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_self_host_connects_within_first_attempt() {
        let mut config = fast_config(0);
        config.supervisor.backoff_base_ms = 60_000;
        let mut supervisor = tokio::time::timeout(Duration::from_secs(5), Supervisor::start(config))
            .await
            .expect("hosting should not wait for a backoff")
            .unwrap();
        assert!(supervisor.is_hosting());
        assert!(supervisor.client().ping().await.is_ok());
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_joins_existing_store() {
        let server = ShareServer::spawn(&ServerConfig::ephemeral()).await.unwrap();
        let mut supervisor = Supervisor::start(fast_config(server.socket_addr().port())).await.unwrap();
        assert!(!supervisor.is_hosting());
        supervisor.cleanup().await;
        // Not ours to stop
        assert!(server.is_running());
    }

    #[tokio::test]
    async fn test_exhausts_without_self_host() {
        let mut config = fast_config(unused_port());
        config.supervisor.self_host = false;
        let err = Supervisor::start(config).await.err().unwrap();
        assert!(matches!(err, ShareError::ConnectionExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_handshake_fails_without_worker() {
        let mut supervisor = Supervisor::start(fast_config(0)).await.unwrap();
        let err = supervisor.verify_connection().await.unwrap_err();
        assert!(matches!(err, ShareError::HandshakeFailed { attempts: 2 }));
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_failed_launch_is_torn_down() {
        let mut config = fast_config(0);
        // A program that never answers the handshake
        config.supervisor.worker_program = Some(PathBuf::from("sleep"));
        config.supervisor.worker_args = vec!["30".to_string()];
        let mut supervisor = Supervisor::start(config).await.unwrap();

        let err = supervisor.launch_client_process(&json!({}), true).await.unwrap_err();
        assert!(matches!(err, ShareError::HandshakeFailed { .. }));
        assert!(supervisor.worker().is_none());
        assert_eq!(supervisor.worker_state(), WorkerState::Terminated);
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_spawn_error_for_missing_program() {
        let mut config = fast_config(0);
        config.supervisor.worker_program = Some(PathBuf::from("/nonexistent/procshare-worker"));
        let mut supervisor = Supervisor::start(config).await.unwrap();

        let err = supervisor.launch_client_process(&Value::Null, true).await.unwrap_err();
        assert!(matches!(err, ShareError::Io(_)));
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let mut supervisor = Supervisor::start(fast_config(0)).await.unwrap();
        let client = supervisor.client().clone();
        supervisor.cleanup().await;
        supervisor.cleanup().await;
        assert!(client.ping().await.unwrap_err().is_retryable());
    }
}
