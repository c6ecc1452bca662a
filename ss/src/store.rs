//! Shared store - actor that owns the key/value map and the method table
//!
//! All reads, writes and method calls are processed one at a time by a single task, which
//! makes every operation atomic with respect to every other regardless of how many
//! connections are issuing them.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{ShareError, ShareResult};
use crate::messages::{CallArgs, RegisteredMethod, StoreCommand};

/// Append `value` to the queue held in `existing`
///
/// Absent becomes a one-element queue; a scalar is first wrapped so the result is always a
/// sequence and firing is always additive.
pub fn append_to_queue(existing: Option<Value>, value: Value) -> Value {
    match existing {
        None | Some(Value::Null) => Value::Array(vec![value]),
        Some(Value::Array(mut items)) => {
            items.push(value);
            Value::Array(items)
        }
        Some(scalar) => Value::Array(vec![scalar, value]),
    }
}

/// The in-memory map and method registry
///
/// Plain data structure; concurrency is provided by the actor in [`StoreHandle`].
#[derive(Debug, Default)]
pub struct Store {
    data: BTreeMap<String, Value>,
    methods: HashMap<String, RegisteredMethod>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; `null` removes the key since it reads back as absent anyway
    pub fn set(&mut self, key: String, value: Value) {
        if value.is_null() {
            self.data.remove(&key);
        } else {
            self.data.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).cloned()
    }

    /// Batch read; absent keys are omitted and an all-absent batch is `None`
    pub fn get_many(&self, keys: &[String]) -> Option<Map<String, Value>> {
        let found: Map<String, Value> = keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        if found.is_empty() { None } else { Some(found) }
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove a key, returning whether a value was present
    pub fn delete(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn list_data(&self) -> Vec<(String, Value)> {
        self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Drop every entry; registered methods are kept
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Register a method; a later registration under the same name replaces the earlier one
    pub fn register_method(&mut self, name: String, method: RegisteredMethod) {
        if let Some(previous) = self.methods.insert(name.clone(), method) {
            debug!(%name, ?previous, "register_method: replaced existing registration");
        }
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Invoke a registered method
    ///
    /// Relay methods queue the call under their event name and report where it went.
    pub fn call_method(&mut self, name: &str, args: CallArgs) -> ShareResult<Value> {
        let method = self
            .methods
            .get(name)
            .cloned()
            .ok_or_else(|| ShareError::MethodNotFound(name.to_string()))?;

        match method {
            RegisteredMethod::Native(f) => match panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(result) => result.map_err(|e| ShareError::CallFailed(format!("{:#}", e))),
                Err(payload) => Err(ShareError::CallFailed(format!(
                    "method {} panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                ))),
            },
            RegisteredMethod::Relay { event } => {
                let call = json!({
                    "method": name,
                    "args": args.args,
                    "kwargs": args.kwargs,
                });
                let existing = self.data.remove(&event);
                self.data.insert(event.clone(), append_to_queue(existing, call));
                Ok(json!({ "queued": event }))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cloneable handle to the store actor
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
    closed: Arc<watch::Sender<bool>>,
}

impl StoreHandle {
    /// Spawn a new store actor on the current tokio runtime
    pub fn spawn() -> Self {
        debug!("StoreHandle::spawn: called");
        let (tx, rx) = mpsc::channel(256);
        let (closed_tx, _) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        tokio::spawn(actor_loop(Store::new(), rx, closed.clone()));
        info!("Store actor spawned");

        Self { tx, closed }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand) -> ShareResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| ShareError::StoreClosed)?;
        reply_rx.await.map_err(|_| ShareError::StoreClosed)
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) -> ShareResult<()> {
        let key = key.into();
        debug!(%key, "set: called");
        self.request(|reply| StoreCommand::Set { key, value, reply }).await
    }

    pub async fn get(&self, key: impl Into<String>) -> ShareResult<Option<Value>> {
        let key = key.into();
        debug!(%key, "get: called");
        self.request(|reply| StoreCommand::Get { key, reply }).await
    }

    pub async fn get_many(&self, keys: Vec<String>) -> ShareResult<Option<Map<String, Value>>> {
        debug!(?keys, "get_many: called");
        self.request(|reply| StoreCommand::GetMany { keys, reply }).await
    }

    pub async fn has(&self, key: impl Into<String>) -> ShareResult<bool> {
        let key = key.into();
        self.request(|reply| StoreCommand::Has { key, reply }).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> ShareResult<bool> {
        let key = key.into();
        debug!(%key, "delete: called");
        self.request(|reply| StoreCommand::Delete { key, reply }).await
    }

    pub async fn list_keys(&self) -> ShareResult<Vec<String>> {
        self.request(|reply| StoreCommand::ListKeys { reply }).await
    }

    pub async fn list_data(&self) -> ShareResult<Vec<(String, Value)>> {
        self.request(|reply| StoreCommand::ListData { reply }).await
    }

    pub async fn clear(&self) -> ShareResult<()> {
        debug!("clear: called");
        self.request(|reply| StoreCommand::Clear { reply }).await
    }

    pub async fn register_method(&self, name: impl Into<String>, method: RegisteredMethod) -> ShareResult<()> {
        let name = name.into();
        debug!(%name, ?method, "register_method: called");
        self.request(|reply| StoreCommand::RegisterMethod { name, method, reply })
            .await
    }

    /// Call a registered method; an unregistered name is `MethodNotFound`
    pub async fn call_method(&self, name: impl Into<String>, args: CallArgs) -> ShareResult<Value> {
        let name = name.into();
        debug!(%name, "call_method: called");
        self.request(|reply| StoreCommand::CallMethod { name, args, reply })
            .await?
    }

    /// Stop the actor; idempotent
    pub async fn shutdown(&self) {
        debug!("shutdown: called");
        if self.tx.send(StoreCommand::Shutdown).await.is_err() {
            debug!("shutdown: actor already stopped");
        }
        self.closed.send_replace(true);
    }

    /// Synchronous variant of [`shutdown`](Self::shutdown) for use from `Drop`
    pub fn shutdown_now(&self) {
        let _ = self.tx.try_send(StoreCommand::Shutdown);
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the store has shut down
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Flags the store closed when the actor exits, including by unwinding
struct ClosedOnExit(Arc<watch::Sender<bool>>);

impl Drop for ClosedOnExit {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StoreCommand>, closed: Arc<watch::Sender<bool>>) {
    let _closed = ClosedOnExit(closed);
    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Set { key, value, reply } => {
                store.set(key, value);
                let _ = reply.send(());
            }
            StoreCommand::Get { key, reply } => {
                let _ = reply.send(store.get(&key));
            }
            StoreCommand::GetMany { keys, reply } => {
                let _ = reply.send(store.get_many(&keys));
            }
            StoreCommand::Has { key, reply } => {
                let _ = reply.send(store.has(&key));
            }
            StoreCommand::Delete { key, reply } => {
                let _ = reply.send(store.delete(&key));
            }
            StoreCommand::ListKeys { reply } => {
                let _ = reply.send(store.list_keys());
            }
            StoreCommand::ListData { reply } => {
                let _ = reply.send(store.list_data());
            }
            StoreCommand::Clear { reply } => {
                store.clear();
                let _ = reply.send(());
            }
            StoreCommand::RegisterMethod { name, method, reply } => {
                store.register_method(name, method);
                let _ = reply.send(());
            }
            StoreCommand::CallMethod { name, args, reply } => {
                let result = store.call_method(&name, args);
                if let Err(e) = &result {
                    warn!(%name, error = %e, "call_method failed");
                }
                let _ = reply.send(result);
            }
            StoreCommand::Shutdown => {
                info!("Store actor shutting down");
                break;
            }
        }
    }
    debug!("actor_loop: exited");
}
