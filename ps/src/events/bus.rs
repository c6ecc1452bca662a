//! Event Bus - polling publish/subscribe over the shared store
//!
//! Firing appends to a queue stored under the event name. Listening polls the names that
//! have a local callback, deletes each non-empty queue and then hands its items to the
//! callback in fire order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use sharestore::{ShareError, ShareResult, StoreClient, append_to_queue};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::callback::{EventHandler, MethodHandler, invoke, relay_listener};
use crate::config::EventsConfig;

/// Prefix of the event a served method's calls are queued under
pub const METHOD_EVENT_PREFIX: &str = "__method__:";

/// Event name that calls to `method` are relayed to
pub fn method_event(method: &str) -> String {
    format!("{}{}", METHOD_EVENT_PREFIX, method)
}

tokio::task_local! {
    /// Id of the listening loop running on this task
    static CURRENT_LOOP: u64;
}

/// Where the listening loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Spawned task; `start_listening` returns immediately
    Background,
    /// On the caller's task; `start_listening` returns once the loop is stopped
    Blocking,
}

/// Result of [`EventBus::listen_once`]
#[derive(Debug, Clone, PartialEq)]
pub enum Once {
    /// Nothing was queued (or the bus shut down while waiting)
    NoData,
    /// Exactly one event without a local listener arrived; this is its first queued item
    Reply(Value),
    /// Several events without a local listener arrived, keyed by name
    Replies(Map<String, Value>),
    /// Everything that arrived belonged to local listeners; this many items were delivered
    Dispatched(usize),
}

struct ListenLoop {
    id: u64,
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    client: StoreClient,
    listeners: Mutex<BTreeMap<String, EventHandler>>,
    current: AsyncMutex<Option<ListenLoop>>,
    draining: Mutex<Vec<(u64, watch::Receiver<bool>)>>,
    next_loop_id: AtomicU64,
    poll_interval: Duration,
    retry_interval: Duration,
    shutdown: watch::Sender<bool>,
}

/// Per-process event bus
///
/// Cheap to clone; clones share listeners and the listening loop.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(client: StoreClient) -> Self {
        Self::with_config(client, &EventsConfig::default())
    }

    pub fn with_config(client: StoreClient, config: &EventsConfig) -> Self {
        debug!(endpoint = %client.endpoint(), ?config, "EventBus::with_config: called");
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client,
                listeners: Mutex::new(BTreeMap::new()),
                current: AsyncMutex::new(None),
                draining: Mutex::new(Vec::new()),
                next_loop_id: AtomicU64::new(1),
                poll_interval: config.poll_interval(),
                retry_interval: config.listen_retry(),
                shutdown,
            }),
        }
    }

    /// Handle that does not keep the bus alive, for callbacks that refer back to it
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The store client the bus runs on
    pub fn client(&self) -> &StoreClient {
        &self.inner.client
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<String, EventHandler>> {
        self.inner.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `value` to the queue under `name`
    ///
    /// Read-modify-write across two round trips: two processes firing the same name at the
    /// same moment can lose one of the values.
    pub async fn fire_event(&self, name: impl Into<String>, value: Value) -> ShareResult<()> {
        let name = name.into();
        debug!(%name, "fire_event: called");
        let existing = self.inner.client.get_data(&name).await?;
        self.inner.client.set_data(name, append_to_queue(existing, value)).await
    }

    /// Register the callback for `name`; a second registration is [`ShareError::DuplicateListener`]
    pub fn add_event_listener(&self, name: impl Into<String>, callback: EventHandler) -> ShareResult<()> {
        let name = name.into();
        let mut listeners = self.listeners();
        if listeners.contains_key(&name) {
            return Err(ShareError::DuplicateListener(name));
        }
        debug!(%name, "add_event_listener: registered");
        listeners.insert(name, callback);
        Ok(())
    }

    /// Remove the callback for `name`, returning whether one was registered
    pub fn remove_event_listener(&self, name: &str) -> bool {
        self.listeners().remove(name).is_some()
    }

    pub fn clear_listeners(&self) {
        self.listeners().clear();
    }

    pub fn has_listener(&self, name: &str) -> bool {
        self.listeners().contains_key(name)
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.listeners().keys().cloned().collect()
    }

    fn listener(&self, name: &str) -> Option<EventHandler> {
        self.listeners().get(name).cloned()
    }

    /// Run the polling loop, replacing any loop already running
    pub async fn start_listening(&self, mode: ListenMode) {
        self.stop_listening().await;

        let id = self.inner.next_loop_id.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        info!(id, ?mode, "Starting event loop");

        let mut current = self.inner.current.lock().await;
        let (task, blocking) = match mode {
            ListenMode::Background => (
                Some(tokio::spawn(CURRENT_LOOP.scope(id, run_loop(weak, stop_rx, done_tx)))),
                None,
            ),
            ListenMode::Blocking => (None, Some((weak, stop_rx, done_tx))),
        };
        let replaced = current.replace(ListenLoop {
            id,
            stop: stop_tx,
            done: done_rx,
            task,
        });
        drop(current);

        // A loop that stopped itself may still be finishing its batch
        if let Some(previous) = replaced {
            self.draining().push((previous.id, previous.done));
        }

        if let Some((weak, stop_rx, done_tx)) = blocking {
            CURRENT_LOOP.scope(id, run_loop(weak, stop_rx, done_tx)).await;

            let mut current = self.inner.current.lock().await;
            if current.as_ref().is_some_and(|active| active.id == id) {
                *current = None;
            }
        }
    }

    fn draining(&self) -> MutexGuard<'_, Vec<(u64, watch::Receiver<bool>)>> {
        self.inner.draining.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop the polling loop
    ///
    /// Returns once no callback of the loop is running, unless called from one of that loop's
    /// own callbacks, in which case it only flags the loop and returns. Any number of callers
    /// may wait at the same time.
    pub async fn stop_listening(&self) {
        let own_loop = CURRENT_LOOP.try_with(|id| *id).ok();
        let (id, mut done, task) = {
            let mut current = self.inner.current.lock().await;
            let Some(active) = current.as_mut() else {
                drop(current);
                self.wait_for_draining(own_loop).await;
                return;
            };
            debug!(id = active.id, "stop_listening: called");
            active.stop.send_replace(true);

            if own_loop == Some(active.id) {
                // The record stays so outside callers can still wait for the loop to finish
                debug!(id = active.id, "stop_listening: called from the loop itself");
                return;
            }
            (active.id, active.done.clone(), active.task.take())
        };

        // Err means the loop is already gone
        let _ = done.wait_for(|done| *done).await;
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Event loop task ended abnormally");
            }
        }

        {
            let mut current = self.inner.current.lock().await;
            if current.as_ref().is_some_and(|active| active.id == id) {
                *current = None;
            }
        }
        self.wait_for_draining(own_loop).await;
        info!(id, "Event loop stopped");
    }

    /// Wait for replaced loops that are still finishing their last batch
    ///
    /// `own_loop` is skipped: a callback cannot wait for the loop it runs on.
    async fn wait_for_draining(&self, own_loop: Option<u64>) {
        let pending: Vec<(u64, watch::Receiver<bool>)> = self.draining().clone();
        for (id, mut done) in pending {
            if Some(id) != own_loop {
                let _ = done.wait_for(|done| *done).await;
            }
        }
        self.draining().retain(|(_, done)| !*done.borrow());
    }

    pub async fn is_listening(&self) -> bool {
        self.inner
            .current
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| !*active.done.borrow())
    }

    /// One poll of every listened name; returns the number of items delivered
    pub async fn poll_tick(&self) -> ShareResult<usize> {
        let names = self.listener_names();
        if names.is_empty() {
            return Ok(0);
        }
        match self.inner.client.get_many(&names).await? {
            Some(batch) => Ok(self.deliver(batch).await),
            None => Ok(0),
        }
    }

    /// Drain each event in `batch` and hand its items to the matching listener
    async fn deliver(&self, batch: Map<String, Value>) -> usize {
        let mut delivered = 0;
        for (name, value) in batch {
            if value.is_null() {
                continue;
            }
            // Delete before dispatch so the same batch is never seen twice
            if let Err(e) = self.inner.client.delete_data(&name).await {
                warn!(%name, error = %e, "Failed to drain event, leaving it queued");
                continue;
            }
            let Some(callback) = self.listener(&name) else {
                debug!(%name, "deliver: listener removed before delivery");
                continue;
            };
            let items = match value {
                Value::Array(items) => items,
                scalar => vec![scalar],
            };
            debug!(%name, count = items.len(), "deliver: dispatching");
            for item in items {
                invoke(&name, &callback, item).await;
                delivered += 1;
            }
        }
        delivered
    }

    /// Single poll for request/response style waits
    ///
    /// `names` defaults to every listened name. Events with a local listener are delivered
    /// as usual. Events without one are drained and returned: a lone event yields its first
    /// queued item (the rest of its queue is discarded), several yield the whole map. When
    /// `non_blocking` is false this sleeps and retries until something arrives or the bus
    /// is shut down.
    pub async fn listen_once(&self, names: Option<&[String]>, non_blocking: bool) -> ShareResult<Once> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.listener_names(),
        };
        debug!(?names, non_blocking, "listen_once: called");
        if names.is_empty() {
            return Ok(Once::NoData);
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return Ok(Once::NoData);
            }

            if let Some(batch) = self.inner.client.get_many(&names).await? {
                let (owned, unowned): (Map<String, Value>, Map<String, Value>) = batch
                    .into_iter()
                    .filter(|(_, value)| !value.is_null())
                    .partition(|(name, _)| self.has_listener(name));

                let dispatched = if owned.is_empty() { 0 } else { self.deliver(owned).await };
                if unowned.is_empty() {
                    return Ok(Once::Dispatched(dispatched));
                }

                for name in unowned.keys() {
                    self.inner.client.delete_data(name).await?;
                }

                if unowned.len() > 1 {
                    return Ok(Once::Replies(unowned));
                }
                let reply = unowned.into_iter().next().and_then(|(_, value)| match value {
                    Value::Array(items) => items.into_iter().next(),
                    scalar => Some(scalar),
                });
                return Ok(reply.map(Once::Reply).unwrap_or(Once::NoData));
            }

            if non_blocking {
                return Ok(Once::NoData);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.retry_interval) => {}
                _ = shutdown.wait_for(|closed| *closed) => return Ok(Once::NoData),
            }
        }
    }

    /// Serve `method` to other processes
    ///
    /// Registers a relay so that remote `CALL`s are queued under [`method_event`], and a
    /// listener that runs `handler` for each queued call.
    pub async fn serve_method(&self, method: impl Into<String>, handler: MethodHandler) -> ShareResult<()> {
        let method = method.into();
        let event = method_event(&method);
        self.add_event_listener(event.clone(), relay_listener(method.clone(), handler))?;
        if let Err(e) = self.inner.client.register_relay(&method, &event).await {
            self.remove_event_listener(&event);
            return Err(e);
        }
        info!(%method, %event, "Serving method");
        Ok(())
    }

    /// Stop listening for good and wake any blocking `listen_once`
    pub async fn shutdown(&self) {
        debug!("EventBus::shutdown: called");
        self.inner.shutdown.send_replace(true);
        self.stop_listening().await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}

/// Non-owning [`EventBus`] handle
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<Inner>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("endpoint", &self.inner.client.endpoint())
            .field("listeners", &self.listener_names())
            .field("poll_interval", &self.inner.poll_interval)
            .finish()
    }
}

async fn run_loop(inner: Weak<Inner>, mut stop: watch::Receiver<bool>, done: watch::Sender<bool>) {
    let Some((poll_interval, mut shutdown)) = inner
        .upgrade()
        .map(|inner| (inner.poll_interval, inner.shutdown.subscribe()))
    else {
        done.send_replace(true);
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = shutdown.wait_for(|closed| *closed) => break,
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let bus = EventBus { inner };
        match bus.poll_tick().await {
            Ok(0) => {}
            Ok(delivered) => debug!(delivered, "run_loop: tick delivered"),
            Err(e) => warn!(error = %e, "Poll tick failed"),
        }
    }

    done.send_replace(true);
    debug!("run_loop: exited");
}
