//! Store actor messages
//!
//! Commands and method registry types for the actor pattern.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::ShareResult;

/// Arguments of a remote method call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

/// In-process handler invoked by `CALL`
pub type NativeMethod = Arc<dyn Fn(CallArgs) -> eyre::Result<Value> + Send + Sync>;

/// An entry in the store's method table
#[derive(Clone)]
pub enum RegisteredMethod {
    /// Closure registered by the process hosting the store
    ///
    /// Runs inside the store actor, so it must not call back into the store.
    Native(NativeMethod),

    /// Method registered over the wire; calls are queued under `event` for the owner to drain
    Relay { event: String },
}

impl RegisteredMethod {
    /// Wrap a closure as a native method
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(CallArgs) -> eyre::Result<Value> + Send + Sync + 'static,
    {
        RegisteredMethod::Native(Arc::new(f))
    }

    pub fn relay(event: impl Into<String>) -> Self {
        RegisteredMethod::Relay { event: event.into() }
    }
}

impl fmt::Debug for RegisteredMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisteredMethod::Native(_) => write!(f, "Native(<fn>)"),
            RegisteredMethod::Relay { event } => f.debug_struct("Relay").field("event", event).finish(),
        }
    }
}

/// Commands sent to the store actor
#[derive(Debug)]
pub enum StoreCommand {
    Set {
        key: String,
        value: Value,
        reply: oneshot::Sender<()>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    GetMany {
        keys: Vec<String>,
        reply: oneshot::Sender<Option<Map<String, Value>>>,
    },
    Has {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    ListKeys {
        reply: oneshot::Sender<Vec<String>>,
    },
    ListData {
        reply: oneshot::Sender<Vec<(String, Value)>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    RegisterMethod {
        name: String,
        method: RegisteredMethod,
        reply: oneshot::Sender<()>,
    },
    CallMethod {
        name: String,
        args: CallArgs,
        reply: oneshot::Sender<ShareResult<Value>>,
    },
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_args_builder() {
        let args = CallArgs::new(vec![json!(1)]).with_kwarg("verbose", true);
        assert_eq!(args.args, vec![json!(1)]);
        assert_eq!(args.kwargs.get("verbose"), Some(&json!(true)));
    }

    #[test]
    fn test_registered_method_debug() {
        let native = RegisteredMethod::native(|_| Ok(Value::Null));
        assert_eq!(format!("{:?}", native), "Native(<fn>)");

        let relay = RegisteredMethod::relay("__method__:reload");
        assert!(format!("{:?}", relay).contains("__method__:reload"));
    }
}
