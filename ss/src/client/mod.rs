//! Store client
//!
//! A stateless stub that turns each store operation into one transport round trip and
//! decodes the result into a typed value. Owns nothing but connection parameters, so it is
//! cheap to construct, clone and discard.

mod http;
mod socket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{ShareError, ShareResult};
use crate::messages::CallArgs;
use crate::wire::{Command, Response, Status};

pub use http::HttpTransport;
pub use socket::SocketTransport;

/// Default timeout for connecting and for each request, on either transport
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Key read by [`StoreClient::ping`]
const PING_KEY: &str = "__ping__";

/// One request/response exchange with a store server
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send a command and return the raw response
    async fn send(&self, command: Command) -> ShareResult<Response>;

    /// Human readable endpoint, for logs
    fn endpoint(&self) -> String;
}

/// Outcome of a remote `CALL`
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The method ran (or was queued, for relay methods) and produced this value
    Returned(Value),
    /// No method is registered under the requested name
    MethodNotFound(String),
}

/// Typed client for the shared store
#[derive(Debug, Clone)]
pub struct StoreClient {
    transport: Arc<dyn Transport>,
}

impl StoreClient {
    /// Client over the framed socket binding described by `config`
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_transport(Arc::new(SocketTransport::new(config)))
    }

    /// Client over the HTTP binding at `base_url` (e.g. `http://localhost:5000`)
    pub fn http(base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self::with_transport(Arc::new(HttpTransport::new(base_url, secret)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Send any command; transport-level refusals become errors, everything else is returned
    pub async fn execute(&self, command: Command) -> ShareResult<Response> {
        debug!(command = command.name(), endpoint = %self.transport.endpoint(), "execute: called");
        let response = self.transport.send(command).await?;
        match response.status {
            Status::Unauthorized => Err(ShareError::Unauthorized),
            Status::BadRequest => Err(ShareError::Protocol(
                response.result.as_str().unwrap_or("bad request").to_string(),
            )),
            _ => Ok(response),
        }
    }

    /// Like [`execute`](Self::execute) but only accepts an `ok` status
    async fn expect_ok(&self, command: Command) -> ShareResult<Value> {
        let name = command.name().to_string();
        let response = self.execute(command).await?;
        match response.status {
            Status::Ok => Ok(response.result),
            Status::UnknownCommand => Err(ShareError::UnknownCommand(name)),
            other => Err(ShareError::Protocol(format!(
                "{} returned {:?}: {}",
                name, other, response.result
            ))),
        }
    }

    pub async fn set_data(&self, key: impl Into<String>, value: Value) -> ShareResult<()> {
        self.expect_ok(Command::Set { key: key.into(), value }).await?;
        Ok(())
    }

    /// Read a key; a missing key is `None`, never an error
    pub async fn get_data(&self, key: impl Into<String>) -> ShareResult<Option<Value>> {
        let value = self.expect_ok(Command::Get { key: key.into() }).await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    /// Batch read; absent keys are omitted and an all-absent batch is `None`
    pub async fn get_many(&self, keys: &[String]) -> ShareResult<Option<Map<String, Value>>> {
        if keys.is_empty() {
            return Ok(None);
        }
        let value = self.expect_ok(Command::GetMany { keys: keys.to_vec() }).await?;
        match value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            Value::Object(map) => Ok(Some(map)),
            other => Err(ShareError::Protocol(format!("GET batch returned {}", other))),
        }
    }

    pub async fn has_data(&self, key: impl Into<String>) -> ShareResult<bool> {
        expect_bool(self.expect_ok(Command::Has { key: key.into() }).await?)
    }

    /// Delete a key; returns whether a value was actually removed
    pub async fn delete_data(&self, key: impl Into<String>) -> ShareResult<bool> {
        expect_bool(self.expect_ok(Command::Delete { key: key.into() }).await?)
    }

    pub async fn list_keys(&self) -> ShareResult<Vec<String>> {
        let value = self.expect_ok(Command::ListKeys).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_data(&self) -> ShareResult<Vec<(String, Value)>> {
        let value = self.expect_ok(Command::ListData).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn clear_data(&self) -> ShareResult<()> {
        self.expect_ok(Command::Clear).await?;
        Ok(())
    }

    /// Call a registered method
    ///
    /// An unregistered name is a normal [`CallOutcome::MethodNotFound`] so callers can branch
    /// on it; a method that ran and failed is [`ShareError::CallFailed`].
    pub async fn call_method(&self, method: impl Into<String>, args: CallArgs) -> ShareResult<CallOutcome> {
        let method = method.into();
        let response = self
            .execute(Command::Call {
                method: method.clone(),
                args: args.args,
                kwargs: args.kwargs,
            })
            .await?;
        match response.status {
            Status::Ok => Ok(CallOutcome::Returned(response.result)),
            Status::MethodNotFound => Ok(CallOutcome::MethodNotFound(method)),
            Status::CallFailed => Err(ShareError::CallFailed(
                response.result.as_str().unwrap_or_default().to_string(),
            )),
            Status::UnknownCommand => Err(ShareError::UnknownCommand("CALL".to_string())),
            other => Err(ShareError::Protocol(format!("CALL returned {:?}", other))),
        }
    }

    /// Register `name` so that calls to it are queued under `event`
    pub async fn register_relay(&self, name: impl Into<String>, event: impl Into<String>) -> ShareResult<()> {
        self.expect_ok(Command::Register {
            name: name.into(),
            event: event.into(),
        })
        .await?;
        Ok(())
    }

    /// Ask the server to shut down
    pub async fn kill(&self) -> ShareResult<()> {
        self.expect_ok(Command::Kill).await?;
        Ok(())
    }

    /// Cheap reachability check
    pub async fn ping(&self) -> ShareResult<()> {
        self.has_data(PING_KEY).await?;
        Ok(())
    }
}

fn expect_bool(value: Value) -> ShareResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| ShareError::Protocol(format!("Expected a boolean, got {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ShareServer;
    use serde_json::json;
    use std::sync::Mutex;

    /// Transport that records commands and replies from a script
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        sent: Mutex<Vec<Command>>,
        replies: Mutex<Vec<Response>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, command: Command) -> ShareResult<Response> {
            self.sent.lock().unwrap().push(command);
            Ok(self.replies.lock().unwrap().remove(0))
        }

        fn endpoint(&self) -> String {
            "scripted".to_string()
        }
    }

    fn scripted(replies: Vec<Response>) -> (StoreClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            sent: Mutex::new(vec![]),
            replies: Mutex::new(replies),
        });
        (StoreClient::with_transport(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_get_data_null_is_none() {
        let (client, _) = scripted(vec![Response::ok(Value::Null)]);
        assert_eq!(client.get_data("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_command_surfaces_as_error() {
        let (client, _) = scripted(vec![Response::unknown_command()]);
        let err = client.list_keys().await.unwrap_err();
        assert!(matches!(err, ShareError::UnknownCommand(name) if name == "LIST_KEYS"));
    }

    #[tokio::test]
    async fn test_call_method_not_found_is_outcome() {
        let (client, transport) = scripted(vec![Response::method_not_found("reload")]);
        let outcome = client.call_method("reload", CallArgs::default()).await.unwrap();
        assert_eq!(outcome, CallOutcome::MethodNotFound("reload".to_string()));
        assert_eq!(transport.sent.lock().unwrap()[0].name(), "CALL");
    }

    #[tokio::test]
    async fn test_unauthorized_is_error() {
        let (client, _) = scripted(vec![Response::unauthorized()]);
        assert!(matches!(client.ping().await.unwrap_err(), ShareError::Unauthorized));
    }

    #[tokio::test]
    async fn test_get_many_skips_round_trip_for_no_keys() {
        let (client, transport) = scripted(vec![]);
        assert_eq!(client.get_many(&[]).await.unwrap(), None);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_socket_client_against_server() {
        let server = ShareServer::spawn(&ServerConfig::ephemeral()).await.unwrap();
        let config = ServerConfig {
            port: server.socket_addr().port(),
            ..ServerConfig::default()
        };
        let client = StoreClient::new(&config);

        client.set_data("a", json!([1, 2])).await.unwrap();
        assert_eq!(client.get_data("a").await.unwrap(), Some(json!([1, 2])));
        assert!(client.has_data("a").await.unwrap());
        assert_eq!(client.list_keys().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(client.list_data().await.unwrap(), vec![("a".to_string(), json!([1, 2]))]);
        assert!(client.delete_data("a").await.unwrap());
        assert!(!client.delete_data("a").await.unwrap());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_client_refused_is_transport_unavailable() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ServerConfig {
            port,
            ..ServerConfig::default()
        };
        let err = StoreClient::new(&config).ping().await.unwrap_err();
        assert!(err.is_retryable(), "expected TransportUnavailable, got {:?}", err);
    }
}
