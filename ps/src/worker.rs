//! Worker Shell - the client side of a supervised pair
//!
//! Connects to the shared store (never hosts it), answers the supervisor's liveness
//! handshake and exits when the supervisor fires `terminate`.

use std::sync::Arc;

use serde_json::{Value, json};
use sharestore::{ShareResult, StoreClient};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::events::{EventBus, ListenMode, handler};
use crate::{ACK_CONNECTION_KEY, PONG, TERMINATE_EVENT, TEST_CONNECTION_KEY};

/// Environment variable carrying the opaque worker configuration as JSON
pub const ENV_WORKER_CONFIG: &str = "SHARE_WORKER_CONFIG";

/// Environment variable carrying the launch id
pub const ENV_WORKER_ID: &str = "SHARE_WORKER_ID";

/// A connected, listening worker
pub struct Worker {
    id: Option<String>,
    payload: Value,
    bus: EventBus,
    exit_tx: Arc<watch::Sender<bool>>,
}

impl Worker {
    /// Connect to the store described by `config` and start answering the supervisor
    pub async fn connect(config: &Config, payload: Value) -> ShareResult<Self> {
        Self::connect_with_id(config, payload, None).await
    }

    /// Connect using the launch environment set by the supervisor
    pub async fn from_env(config: &Config) -> ShareResult<Self> {
        let payload = match std::env::var(ENV_WORKER_CONFIG) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Value::Null,
        };
        let id = std::env::var(ENV_WORKER_ID).ok();
        Self::connect_with_id(config, payload, id).await
    }

    async fn connect_with_id(config: &Config, payload: Value, id: Option<String>) -> ShareResult<Self> {
        debug!(?id, store = %config.store.socket_addr(), "Worker::connect: called");
        let client = StoreClient::new(&config.store);
        config
            .supervisor
            .connect_policy()
            .run(|_| {
                let client = client.clone();
                async move { client.ping().await }
            })
            .await?;
        info!(?id, endpoint = %client.endpoint(), "Worker connected to store");

        let bus = EventBus::with_config(client, &config.events);
        let (exit_tx, _) = watch::channel(false);
        let exit_tx = Arc::new(exit_tx);

        let weak_bus = bus.downgrade();
        let exit = exit_tx.clone();
        bus.add_event_listener(
            TERMINATE_EVENT,
            handler(move |_| {
                let weak_bus = weak_bus.clone();
                let exit = exit.clone();
                async move {
                    info!("Terminate event received");
                    exit.send_replace(true);
                    if let Some(bus) = weak_bus.upgrade() {
                        bus.stop_listening().await;
                    }
                    Ok(())
                }
            }),
        )?;

        let ack_client = bus.client().clone();
        bus.add_event_listener(
            TEST_CONNECTION_KEY,
            handler(move |ping| {
                let client = ack_client.clone();
                async move {
                    debug!(%ping, "Answering connection test");
                    client.set_data(ACK_CONNECTION_KEY, json!(PONG)).await?;
                    Ok(())
                }
            }),
        )?;

        bus.start_listening(ListenMode::Background).await;

        Ok(Self {
            id,
            payload,
            bus,
            exit_tx,
        })
    }

    /// Launch id assigned by the supervisor, if launched by one
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The configuration value the controller passed at launch
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Ask the worker to exit, as if `terminate` had been fired
    pub fn request_exit(&self) {
        self.exit_tx.send_replace(true);
    }

    pub fn exit_requested(&self) -> bool {
        *self.exit_tx.borrow()
    }

    /// Resolve once exit has been requested, then shut the bus down
    pub async fn wait_for_exit(&self) {
        let mut exit = self.exit_tx.subscribe();
        // The sender lives in self, so this only ends on `true`
        let _ = exit.wait_for(|requested| *requested).await;
        self.bus.shutdown().await;
        info!(id = ?self.id, "Worker exiting");
    }
}
