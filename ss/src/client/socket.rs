//! Framed socket transport
//!
//! Opens one connection per request, the way short-lived callers (CLIs, poll loops) use it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{DEFAULT_TIMEOUT, Transport};
use crate::config::ServerConfig;
use crate::error::{ShareError, ShareResult};
use crate::wire::{Command, Response, Status, read_frame, write_frame};

#[derive(Debug, Clone)]
pub struct SocketTransport {
    addr: String,
    secret: Option<String>,
    timeout: Duration,
}

impl SocketTransport {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            addr: config.socket_addr(),
            secret: config.secret.clone(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> ShareResult<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ShareError::TransportUnavailable(format!("{}: {}", self.addr, e))),
            Err(_) => Err(ShareError::TransportUnavailable(format!("{}: connect timed out", self.addr))),
        }
    }

    async fn exchange(&self, stream: &mut TcpStream, command: &Command) -> ShareResult<Response> {
        match tokio::time::timeout(self.timeout, round_trip(stream, command)).await {
            Ok(Err(ShareError::Io(e))) => Err(ShareError::TransportUnavailable(format!("{}: {}", self.addr, e))),
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(ShareError::TransportUnavailable(format!(
                "{}: connection closed before reply",
                self.addr
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ShareError::TransportUnavailable(format!("{}: request timed out", self.addr))),
        }
    }
}

/// Write one request frame and read its reply; `None` if the server hung up first
async fn round_trip(stream: &mut TcpStream, command: &Command) -> ShareResult<Option<Response>> {
    write_frame(stream, &command.to_frame()).await?;
    match read_frame(stream).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, command: Command) -> ShareResult<Response> {
        let mut stream = self.connect().await?;

        if let Some(secret) = &self.secret {
            let auth = Command::Auth { secret: secret.clone() };
            let reply = self.exchange(&mut stream, &auth).await?;
            if reply.status != Status::Ok {
                return Ok(reply);
            }
        }

        let response = self.exchange(&mut stream, &command).await?;
        debug!(command = command.name(), status = ?response.status, "SocketTransport::send: reply");
        Ok(response)
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ShareServer;
    use serde_json::json;

    #[test]
    fn test_endpoint_and_timeout() {
        let transport = SocketTransport::new(&ServerConfig::default()).with_timeout(Duration::from_secs(1));
        assert_eq!(transport.endpoint(), "tcp://127.0.0.1:50000");
        assert_eq!(transport.timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_secret_is_sent_first() {
        let config = ServerConfig {
            secret: Some("s3cret".to_string()),
            ..ServerConfig::ephemeral()
        };
        let server = ShareServer::spawn(&config).await.unwrap();
        let client_config = ServerConfig {
            port: server.socket_addr().port(),
            ..config.clone()
        };

        let transport = SocketTransport::new(&client_config);
        let resp = transport
            .send(Command::Set {
                key: "k".to_string(),
                value: json!(1),
            })
            .await
            .unwrap();
        assert_eq!(resp.result, json!(true));

        let wrong = SocketTransport::new(&ServerConfig {
            secret: Some("wrong".to_string()),
            ..client_config
        });
        let resp = wrong.send(Command::ListKeys).await.unwrap();
        assert_eq!(resp.status, Status::Unauthorized);

        server.shutdown().await;
    }
}
