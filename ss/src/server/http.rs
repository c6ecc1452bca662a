//! Stateless HTTP binding
//!
//! `POST /command` with `{"command": ..., "args": [...]}` answers `{"result": ...}`.
//! The same listener serves the file registry:
//!
//! | Route                   | Answer                                               |
//! |-------------------------|------------------------------------------------------|
//! | `POST /upload`          | multipart field `file`; 201 `{"result", "url"}`      |
//! | `GET /download/:id`     | the file as an attachment under its original name    |
//! | `DELETE /delete/:id`    | 200 `{"result": "File deleted"}`                     |
//!
//! CORS is left open so a browser UI can talk to the store directly.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response as HttpResponse},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use super::dispatch;
use crate::error::ShareError;
use crate::files::FileRegistry;
use crate::store::StoreHandle;
use crate::wire::{Command, CommandRequest, MAX_FRAME_SIZE, Response};

/// Header carrying the shared secret
pub const SECRET_HEADER: &str = "x-share-secret";

struct HttpState {
    store: StoreHandle,
    secret: Option<String>,
    files: Arc<FileRegistry>,
}

impl HttpState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.secret {
            Some(secret) => headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) == Some(secret.as_str()),
            None => true,
        }
    }
}

fn router(store: StoreHandle, secret: Option<String>, files: Arc<FileRegistry>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/command", post(handle_command))
        .route("/upload", post(handle_upload))
        .route("/download/:id", get(handle_download))
        .route("/delete/:id", delete(handle_delete))
        .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
        .layer(cors)
        .with_state(Arc::new(HttpState { store, secret, files }))
}

/// Serve until the store shuts down
pub(super) async fn serve(listener: TcpListener, store: StoreHandle, secret: Option<String>, files: Arc<FileRegistry>) {
    let closed = store.clone();
    let app = router(store, secret, files);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { closed.closed().await })
        .await
    {
        error!(error = %e, "HTTP binding failed");
    }
    info!("HTTP binding stopped");
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_command(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Response>) {
    if !state.authorized(&headers) {
        warn!("Rejecting unauthorized HTTP request");
        return (StatusCode::UNAUTHORIZED, Json(Response::unauthorized()));
    }

    let command = match serde_json::from_slice::<CommandRequest>(&body)
        .map_err(crate::error::ShareError::from)
        .and_then(Command::from_request)
    {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "handle_command: malformed request");
            return (StatusCode::BAD_REQUEST, Json(Response::bad_request(e.to_string())));
        }
    };

    let kill = matches!(command, Command::Kill);
    let response = dispatch(&state.store, command).await;

    if kill {
        // Graceful shutdown lets this response finish before the listener closes
        let store = state.store.clone();
        tokio::spawn(async move { store.shutdown().await });
    }

    (StatusCode::OK, Json(response))
}

fn file_reply(status: StatusCode, result: &str) -> HttpResponse {
    (status, Json(json!({ "result": result }))).into_response()
}

async fn handle_upload(State(state): State<Arc<HttpState>>, headers: HeaderMap, mut multipart: Multipart) -> HttpResponse {
    if !state.authorized(&headers) {
        warn!("Rejecting unauthorized upload");
        return file_reply(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "handle_upload: malformed multipart body");
                return file_reply(StatusCode::BAD_REQUEST, &e.body_text());
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return file_reply(StatusCode::BAD_REQUEST, "No selected file");
        }
        let contents = match field.bytes().await {
            Ok(contents) => contents,
            Err(e) => return file_reply(StatusCode::BAD_REQUEST, &e.body_text()),
        };

        return match state.files.save(&filename, &contents).await {
            Ok(id) => (
                StatusCode::CREATED,
                Json(json!({ "result": "File uploaded", "url": format!("/download/{}", id) })),
            )
                .into_response(),
            Err(ShareError::Protocol(message)) => file_reply(StatusCode::BAD_REQUEST, &message),
            Err(e) => {
                error!(%filename, error = %e, "Failed to save upload");
                file_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
    }

    file_reply(StatusCode::BAD_REQUEST, "No file part")
}

async fn handle_download(State(state): State<Arc<HttpState>>, headers: HeaderMap, Path(id): Path<String>) -> HttpResponse {
    if !state.authorized(&headers) {
        return file_reply(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.files.load(&id).await {
        Ok(Some(file)) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", file.name)),
            ],
            file.contents,
        )
            .into_response(),
        Ok(None) => file_reply(StatusCode::NOT_FOUND, "File not found"),
        Err(e) => {
            error!(%id, error = %e, "Error downloading file");
            file_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

async fn handle_delete(State(state): State<Arc<HttpState>>, headers: HeaderMap, Path(id): Path<String>) -> HttpResponse {
    if !state.authorized(&headers) {
        return file_reply(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.files.remove(&id).await {
        Ok(true) => file_reply(StatusCode::OK, "File deleted"),
        Ok(false) => file_reply(StatusCode::NOT_FOUND, "File not found"),
        Err(e) => {
            error!(%id, error = %e, "Error deleting file");
            file_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Status;
    use tempfile::TempDir;

    async fn start(secret: Option<String>) -> (String, StoreHandle) {
        let (base, store, _) = start_with_files(secret, FileRegistry::new("unused-uploads")).await;
        (base, store)
    }

    async fn start_with_files(secret: Option<String>, files: FileRegistry) -> (String, StoreHandle, Arc<FileRegistry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = StoreHandle::spawn();
        let files = Arc::new(files);
        tokio::spawn(serve(listener, store.clone(), secret, files.clone()));
        (format!("http://{}", addr), store, files)
    }

    async fn upload(base: &str, name: &str, contents: &[u8]) -> reqwest::Response {
        let part = reqwest::multipart::Part::bytes(contents.to_vec()).file_name(name.to_string());
        reqwest::Client::new()
            .post(format!("{}/upload", base))
            .multipart(reqwest::multipart::Form::new().part("file", part))
            .send()
            .await
            .unwrap()
    }

    async fn post(base: &str, body: Value) -> (u16, Response) {
        let resp = reqwest::Client::new()
            .post(format!("{}/command", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _store) = start(None).await;
        let body: Value = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_set_and_batch_get() {
        let (base, _store) = start(None).await;
        let (code, resp) = post(&base, json!({"command": "SET", "args": ["a", {"x": 1}]})).await;
        assert_eq!(code, 200);
        assert_eq!(resp.result, json!(true));

        let (_, resp) = post(&base, json!({"command": "GET", "args": [["a", "missing"]]})).await;
        assert_eq!(resp.result, json!({"a": {"x": 1}}));

        let (_, resp) = post(&base, json!({"command": "GET", "args": [["missing"]]})).await;
        assert_eq!(resp.result, Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_command_is_200_with_sentinel() {
        let (base, _store) = start(None).await;
        let (code, resp) = post(&base, json!({"command": "EXPLODE"})).await;
        assert_eq!(code, 200);
        assert_eq!(resp, Response::unknown_command());
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let (base, _store) = start(None).await;
        let (code, resp) = post(&base, json!({"args": []})).await;
        assert_eq!(code, 400);
        assert_eq!(resp.status, Status::BadRequest);
    }

    #[tokio::test]
    async fn test_secret_header() {
        let (base, _store) = start(Some("s3cret".to_string())).await;
        let (code, resp) = post(&base, json!({"command": "LIST_KEYS"})).await;
        assert_eq!(code, 401);
        assert_eq!(resp.status, Status::Unauthorized);

        let resp: Response = reqwest::Client::new()
            .post(format!("{}/command", base))
            .header(SECRET_HEADER, "s3cret")
            .json(&json!({"command": "LIST_KEYS"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp.result, json!([]));
    }

    #[tokio::test]
    async fn test_kill_closes_store() {
        let (base, store) = start(None).await;
        let (code, _) = post(&base, json!({"command": "KILL"})).await;
        assert_eq!(code, 200);
        tokio::time::timeout(std::time::Duration::from_secs(5), store.closed())
            .await
            .expect("store should close after KILL");
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let dir = TempDir::new().unwrap();
        let (base, _store, files) = start_with_files(None, FileRegistry::new(dir.path())).await;

        let resp = upload(&base, "quarterly report.csv", b"a,b\n1,2\n").await;
        assert_eq!(resp.status().as_u16(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"], json!("File uploaded"));
        let url = body["url"].as_str().unwrap().to_string();
        let id = url.trim_start_matches("/download/").to_string();
        assert_eq!(files.list(), vec![(id.clone(), "quarterly_report.csv".to_string())]);

        let resp = reqwest::get(format!("{}{}", base, url)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.contains("quarterly_report.csv"));
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"a,b\n1,2\n");

        let client = reqwest::Client::new();
        let resp = client.delete(format!("{}/delete/{}", base, id)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let resp = client.delete(format!("{}/delete/{}", base, id)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        let resp = reqwest::get(format!("{}{}", base, url)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"result": "File not found"}));
    }

    #[tokio::test]
    async fn test_upload_without_file_part() {
        let dir = TempDir::new().unwrap();
        let (base, _store, files) = start_with_files(None, FileRegistry::new(dir.path())).await;

        let form = reqwest::multipart::Form::new().text("note", "no file here");
        let resp = reqwest::Client::new()
            .post(format!("{}/upload", base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"result": "No file part"}));
        assert!(files.list().is_empty());
    }

    #[tokio::test]
    async fn test_file_routes_require_secret() {
        let dir = TempDir::new().unwrap();
        let (base, _store, files) = start_with_files(Some("s3cret".to_string()), FileRegistry::new(dir.path())).await;

        let resp = upload(&base, "a.txt", b"x").await;
        assert_eq!(resp.status().as_u16(), 401);
        assert!(files.list().is_empty());
    }
}
