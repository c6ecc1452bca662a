//! Persistent framed socket binding
//!
//! Each request and response is one length-prefixed JSON frame; a connection may carry any
//! number of round trips.

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::dispatch;
use crate::error::{ShareError, ShareResult};
use crate::store::StoreHandle;
use crate::wire::{Command, Response, read_frame, write_frame};

/// Accept connections until the store shuts down
pub(super) async fn serve(listener: TcpListener, store: StoreHandle, secret: Option<String>) {
    loop {
        tokio::select! {
            _ = store.closed() => {
                debug!("socket::serve: store closed, no longer accepting");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "socket::serve: accepted connection");
                    let store = store.clone();
                    let secret = secret.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store, secret).await {
                            warn!(%peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, store: StoreHandle, secret: Option<String>) -> ShareResult<()> {
    let mut authorized = secret.is_none();

    loop {
        let body = tokio::select! {
            _ = store.closed() => break,
            frame = read_frame(&mut stream) => match frame? {
                Some(body) => body,
                None => break,
            },
        };

        let command = match serde_json::from_slice::<Value>(&body)
            .map_err(ShareError::from)
            .and_then(Command::from_frame)
        {
            Ok(command) => command,
            Err(e) if authorized => {
                debug!(error = %e, "handle_connection: malformed request");
                write_frame(&mut stream, &Response::bad_request(e.to_string())).await?;
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Malformed request before AUTH, closing connection");
                write_frame(&mut stream, &Response::unauthorized()).await?;
                break;
            }
        };

        if !authorized {
            match &command {
                Command::Auth { secret: given } if secret.as_deref() == Some(given.as_str()) => {
                    authorized = true;
                    write_frame(&mut stream, &Response::ok(true)).await?;
                    continue;
                }
                _ => {
                    warn!("Rejecting unauthorized connection");
                    write_frame(&mut stream, &Response::unauthorized()).await?;
                    break;
                }
            }
        }

        let kill = matches!(command, Command::Kill);
        let response = dispatch(&store, command).await;
        write_frame(&mut stream, &response).await?;

        if kill {
            debug!("handle_connection: KILL received");
            store.shutdown().await;
            break;
        }
    }

    debug!("handle_connection: closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Status;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    async fn start(secret: Option<String>) -> (std::net::SocketAddr, StoreHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = StoreHandle::spawn();
        tokio::spawn(serve(listener, store.clone(), secret));
        (addr, store)
    }

    async fn round_trip(stream: &mut TcpStream, frame: Value) -> Response {
        write_frame(stream, &frame).await.unwrap();
        let body = read_frame(stream).await.unwrap().unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_many_round_trips_on_one_connection() {
        let (addr, _store) = start(None).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        assert_eq!(round_trip(&mut stream, json!(["SET", "a", 1])).await.result, json!(true));
        assert_eq!(round_trip(&mut stream, json!(["GET", "a"])).await.result, json!(1));
        assert_eq!(round_trip(&mut stream, json!(["HAS", "a"])).await.result, json!(true));
        assert_eq!(round_trip(&mut stream, json!(["DELETE", "a"])).await.result, json!(true));
        assert_eq!(round_trip(&mut stream, json!(["DELETE", "a"])).await.result, json!(false));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_keep_connection_open() {
        let (addr, _store) = start(None).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let resp = round_trip(&mut stream, json!(["NOPE"])).await;
        assert_eq!(resp.status, Status::UnknownCommand);

        // Raw garbage inside a valid frame
        stream.write_u32(3).await.unwrap();
        stream.write_all(b"{{{").await.unwrap();
        let body = read_frame(&mut stream).await.unwrap().unwrap();
        let resp: Response = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.status, Status::BadRequest);

        let resp = round_trip(&mut stream, json!(["LIST_KEYS"])).await;
        assert_eq!(resp.result, json!([]));
    }

    #[tokio::test]
    async fn test_secret_required_first() {
        let (addr, _store) = start(Some("s3cret".to_string())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let resp = round_trip(&mut stream, json!(["GET", "a"])).await;
        assert_eq!(resp.status, Status::Unauthorized);
        assert!(read_frame(&mut stream).await.unwrap().is_none());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(round_trip(&mut stream, json!(["AUTH", "s3cret"])).await.result, json!(true));
        assert_eq!(round_trip(&mut stream, json!(["HAS", "a"])).await.result, json!(false));
    }

    #[tokio::test]
    async fn test_malformed_frame_before_auth_closes_connection() {
        let (addr, _store) = start(Some("s3cret".to_string())).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_u32(3).await.unwrap();
        stream.write_all(b"{{{").await.unwrap();
        let body = read_frame(&mut stream).await.unwrap().unwrap();
        let resp: Response = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.status, Status::Unauthorized);
        assert!(read_frame(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_replies_then_shuts_down() {
        let (addr, store) = start(None).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let resp = round_trip(&mut stream, json!(["KILL"])).await;
        assert_eq!(resp.result, json!(crate::wire::SHUTTING_DOWN));

        tokio::time::timeout(std::time::Duration::from_secs(5), store.closed())
            .await
            .expect("store should close after KILL");
    }

    #[tokio::test]
    async fn test_one_broken_connection_does_not_affect_others() {
        let (addr, _store) = start(None).await;

        let mut good = TcpStream::connect(addr).await.unwrap();
        assert_eq!(round_trip(&mut good, json!(["SET", "k", "v"])).await.result, json!(true));

        // Half a frame, then hang up
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_u32(100).await.unwrap();
        bad.write_all(b"[\"SE").await.unwrap();
        drop(bad);

        assert_eq!(round_trip(&mut good, json!(["GET", "k"])).await.result, json!("v"));
    }
}
