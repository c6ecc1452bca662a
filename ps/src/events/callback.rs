//! Listener callbacks

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sharestore::CallArgs;
use tracing::{error, warn};

/// Callback invoked once per delivered event item
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Callback serving a relayed method call
pub type MethodHandler = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`]
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

/// Wrap an async closure as a [`MethodHandler`]
pub fn method_handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Adapt a method handler to the queued call objects a relay produces
pub(crate) fn relay_listener(method: String, handler: MethodHandler) -> EventHandler {
    Arc::new(move |call| {
        let handler = handler.clone();
        let method = method.clone();
        async move {
            let args = decode_call(&call)
                .ok_or_else(|| eyre::eyre!("Malformed call for method {}: {}", method, call))?;
            handler(args).await
        }
        .boxed()
    })
}

/// Decode `{"method", "args", "kwargs"}` as queued by a relay method
pub(crate) fn decode_call(call: &Value) -> Option<CallArgs> {
    let object = call.as_object()?;
    let args = match object.get("args") {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return None,
    };
    let kwargs = match object.get("kwargs") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return None,
    };
    Some(CallArgs { args, kwargs })
}

/// Run one callback, isolating its failure from the caller
///
/// Returns whether the callback completed successfully.
pub(crate) async fn invoke(event: &str, callback: &EventHandler, item: Value) -> bool {
    match AssertUnwindSafe(callback(item)).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(%event, error = %e, "Listener callback failed");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%event, %message, "Listener callback panicked");
            false
        }
    }
}
