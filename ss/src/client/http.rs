//! HTTP transport

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{DEFAULT_TIMEOUT, Transport};
use crate::error::{ShareError, ShareResult};
use crate::server::SECRET_HEADER;
use crate::wire::{Command, Response};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    secret: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
            timeout: DEFAULT_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Set a custom timeout for each whole request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Refused connections and timeouts are transient; anything else is a protocol problem
fn map_reqwest_error(url: &str, e: reqwest::Error) -> ShareError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ShareError::TransportUnavailable(format!("{}: {}", url, e))
    } else {
        ShareError::Protocol(format!("{}: {}", url, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, command: Command) -> ShareResult<Response> {
        let url = format!("{}/command", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&command.to_request());
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        let reply = request.send().await.map_err(|e| map_reqwest_error(&url, e))?;
        let status = reply.status();

        // Error statuses still carry a Response body
        let response: Response = reply.json().await.map_err(|e| {
            if e.is_timeout() {
                ShareError::TransportUnavailable(format!("{}: reply timed out", url))
            } else {
                ShareError::Protocol(format!("{} returned {} with unreadable body: {}", url, status, e))
            }
        })?;
        debug!(command = command.name(), %status, "HttpTransport::send: reply");
        Ok(response)
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallOutcome, StoreClient};
    use crate::config::ServerConfig;
    use crate::messages::{CallArgs, RegisteredMethod};
    use crate::server::ShareServer;
    use serde_json::json;

    #[test]
    fn test_trailing_slash_trimmed() {
        let transport = HttpTransport::new("http://localhost:5000/", None);
        assert_eq!(transport.endpoint(), "http://localhost:5000");
    }

    #[tokio::test]
    async fn test_http_and_socket_clients_agree() {
        let config = ServerConfig {
            http_port: Some(0),
            ..ServerConfig::ephemeral()
        };
        let server = ShareServer::spawn(&config).await.unwrap();
        server
            .store()
            .register_method("double", RegisteredMethod::native(|call| {
                Ok(json!(call.args.first().and_then(|v| v.as_i64()).unwrap_or(0) * 2))
            }))
            .await
            .unwrap();

        let http = StoreClient::http(format!("http://{}", server.http_addr().unwrap()), None);
        let socket = StoreClient::new(&ServerConfig {
            port: server.socket_addr().port(),
            ..ServerConfig::default()
        });

        http.set_data("shared", json!({"from": "http"})).await.unwrap();
        assert_eq!(socket.get_data("shared").await.unwrap(), Some(json!({"from": "http"})));

        let keys = vec!["shared".to_string(), "missing".to_string()];
        assert_eq!(http.get_many(&keys).await.unwrap(), socket.get_many(&keys).await.unwrap());

        let via_http = http.call_method("double", CallArgs::new(vec![json!(21)])).await.unwrap();
        let via_socket = socket.call_method("double", CallArgs::new(vec![json!(21)])).await.unwrap();
        assert_eq!(via_http, CallOutcome::Returned(json!(42)));
        assert_eq!(via_http, via_socket);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_hung_server_times_out_as_transport_unavailable() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let transport = HttpTransport::new(format!("http://{}", addr), None).with_timeout(Duration::from_millis(200));
        let client = StoreClient::with_transport(std::sync::Arc::new(transport));
        let err = tokio::time::timeout(Duration::from_secs(5), client.ping())
            .await
            .expect("request should time out on its own")
            .unwrap_err();
        assert!(err.is_retryable(), "expected TransportUnavailable, got {:?}", err);
    }

    #[tokio::test]
    async fn test_refused_is_transport_unavailable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = StoreClient::http(format!("http://127.0.0.1:{}", port), None);
        assert!(client.ping().await.unwrap_err().is_retryable());
    }
}
