//! JSON-over-HTTP/1.1 front end for [`SyncJobManager`]
//!
//! One request per connection (`Connection: close`). Only `Content-Length`
//! framed bodies are accepted.
//!
//! | Route | Body | Reply |
//! |---|---|---|
//! | `GET /api/dirs` | | `{"results":[{path,synced}]}` |
//! | `GET /api/syncs` | | `{"results":[{path,progress,speed,downloaded,time_left,started_at}]}` |
//! | `POST /api/sync` | `{"path"}` | `{}` |
//! | `POST /api/cancel` | `{"path"}` | `{}` |
//! | `POST /api/remove` | `{"path"}` | `{}` |
//!
//! Failures reply `{"error": "<message>"}`.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, SyncError};
use crate::manager::SyncJobManager;

/// Largest accepted request body.
pub const MAX_BODY: usize = 64 * 1024;
const MAX_LINE: u64 = 8 * 1024;
const MAX_HEADERS: usize = 64;

const ROUTES: [&str; 5] = ["/api/dirs", "/api/syncs", "/api/sync", "/api/cancel", "/api/remove"];

#[derive(Debug)]
struct Request {
    method: String,
    target: String,
    body: Vec<u8>,
}

#[derive(Debug)]
struct Response {
    status: u16,
    body: Value,
    error: Option<String>,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            error: None,
        }
    }

    fn empty() -> Self {
        Self::ok(json!({}))
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            body: json!({ "error": message }),
            error: Some(message),
        }
    }

    fn from_sync_error(err: &SyncError) -> Self {
        let status = match err.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Io | ErrorKind::Command => 500,
        };
        Self::error(status, err.to_string())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Cache-Control: no-cache\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            reason(self.status),
            body.len()
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(body.as_bytes());
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

#[derive(Debug, Deserialize)]
struct PathBody {
    path: String,
}

/// Accept connections until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, manager: Arc<SyncJobManager>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("listener stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, Arc::clone(&manager)));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, manager: Arc<SyncJobManager>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let response = match read_request(&mut reader).await {
        Ok(Some(request)) => {
            let response = route(&manager, &request).await;
            log_request(&request.method, &request.target, &response);
            response
        }
        Ok(None) => return,
        Err(response) => {
            log_request("-", "-", &response);
            response
        }
    };

    if let Err(e) = writer.write_all(&response.to_bytes()).await {
        debug!(%peer, error = %e, "client went away before the response was written");
    }
    let _ = writer.shutdown().await;
}

fn log_request(method: &str, uri: &str, response: &Response) {
    match &response.error {
        None => info!(method, uri, status = response.status, "request"),
        Some(error) => warn!(method, uri, status = response.status, error = %error, "request failed"),
    }
}

/// Read one bounded line; `None` on EOF.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, Response>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_LINE)
        .read_line(&mut line)
        .await
        .map_err(|e| Response::error(400, format!("unreadable request: {e}")))?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && n as u64 >= MAX_LINE {
        return Err(Response::error(400, "request header line too long"));
    }
    Ok(Some(line))
}

/// Parse request line, headers and a `Content-Length` body. `Ok(None)` means
/// the peer closed without sending anything.
async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, Response>
where
    R: AsyncBufRead + Unpin,
{
    let Some(request_line) = read_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(Response::error(400, "malformed request line"));
    };
    let method = method.to_string();
    let target = target.to_string();

    let mut content_length = 0usize;
    let mut headers = 0;
    loop {
        let Some(line) = read_line(reader).await? else {
            return Err(Response::error(400, "truncated request headers"));
        };
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        headers += 1;
        if headers > MAX_HEADERS {
            return Err(Response::error(400, "too many request headers"));
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| Response::error(400, "invalid content-length"))?;
            }
        }
    }

    if content_length > MAX_BODY {
        return Err(Response::error(413, "request body too large"));
    }
    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| Response::error(400, "truncated request body"))?;

    Ok(Some(Request {
        method,
        target,
        body,
    }))
}

fn path_from_body(body: &[u8]) -> Result<String, Response> {
    serde_json::from_slice::<PathBody>(body)
        .map(|b| b.path)
        .map_err(|e| Response::error(400, format!("invalid request body: {e}")))
}

async fn route(manager: &SyncJobManager, request: &Request) -> Response {
    let path = request.target.split('?').next().unwrap_or_default();
    match (request.method.as_str(), path) {
        ("GET", "/api/dirs") => match manager.dir_statuses().await {
            Ok(dirs) => Response::ok(json!({ "results": dirs })),
            Err(e) => Response::from_sync_error(&e),
        },
        ("GET", "/api/syncs") => Response::ok(json!({ "results": manager.list() })),
        ("POST", "/api/sync") => match path_from_body(&request.body) {
            Ok(p) => match manager.start(&p).await {
                Ok(()) => Response::empty(),
                Err(e) => Response::from_sync_error(&e),
            },
            Err(response) => response,
        },
        ("POST", "/api/cancel") => match path_from_body(&request.body) {
            Ok(p) => {
                manager.cancel(&p);
                Response::empty()
            }
            Err(response) => response,
        },
        ("POST", "/api/remove") => match path_from_body(&request.body) {
            Ok(p) => match manager.remove(&p).await {
                Ok(()) => Response::empty(),
                Err(e) => Response::from_sync_error(&e),
            },
            Err(response) => response,
        },
        (_, p) if ROUTES.contains(&p) => Response::error(405, "method not allowed"),
        _ => Response::error(404, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::ScriptTools;
    use crate::remote::RemoteTools;
    use std::time::Duration;

    async fn parse(raw: &[u8]) -> Result<Option<Request>, Response> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await
    }

    fn manager() -> (tempfile::TempDir, SyncJobManager) {
        let tmp = tempfile::tempdir().unwrap();
        let tools: Arc<dyn RemoteTools> =
            Arc::new(ScriptTools::new("printf '/\\n/a\\n'", "true"));
        let manager =
            SyncJobManager::new(tmp.path().to_path_buf(), tools, Duration::from_millis(100));
        (tmp, manager)
    }

    fn request(method: &str, target: &str, body: &str) -> Request {
        Request {
            method: method.into(),
            target: target.into(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let raw = b"POST /api/sync HTTP/1.1\r\nHost: x\r\ncontent-length: 13\r\n\r\n{\"path\":\"/a\"}";
        let req = parse(raw).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/api/sync");
        assert_eq!(path_from_body(&req.body).unwrap(), "/a");
    }

    #[tokio::test]
    async fn empty_connection_is_not_a_request() {
        assert!(parse(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_reading() {
        let raw = format!("POST /api/sync HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY + 1);
        let err = parse(raw.as_bytes()).await.unwrap_err();
        assert_eq!(err.status, 413);
    }

    #[tokio::test]
    async fn malformed_heads_are_bad_requests() {
        assert_eq!(parse(b"GARBAGE\r\n\r\n").await.unwrap_err().status, 400);
        assert_eq!(
            parse(b"POST /api/sync HTTP/1.1\r\nContent-Length: nope\r\n\r\n")
                .await
                .unwrap_err()
                .status,
            400
        );
        assert_eq!(
            parse(b"POST /api/sync HTTP/1.1\r\nContent-Length: 50\r\n\r\n{}")
                .await
                .unwrap_err()
                .status,
            400
        );
    }

    #[tokio::test]
    async fn unknown_routes_and_methods() {
        let (_tmp, manager) = manager();
        assert_eq!(route(&manager, &request("GET", "/nope", "")).await.status, 404);
        assert_eq!(route(&manager, &request("GET", "/api/sync", "")).await.status, 405);
        assert_eq!(route(&manager, &request("DELETE", "/api/dirs", "")).await.status, 405);
    }

    #[tokio::test]
    async fn bad_json_is_a_bad_request() {
        let (_tmp, manager) = manager();
        let response = route(&manager, &request("POST", "/api/sync", "{not json")).await;
        assert_eq!(response.status, 400);
        assert!(response.body["error"].as_str().unwrap().starts_with("invalid request body"));
        let response = route(&manager, &request("POST", "/api/remove", "")).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn cancel_always_succeeds() {
        let (_tmp, manager) = manager();
        let response = route(&manager, &request("POST", "/api/cancel", r#"{"path":"/zz"}"#)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({}));
    }

    #[tokio::test]
    async fn syncs_with_no_jobs_is_an_empty_list() {
        let (_tmp, manager) = manager();
        let response = route(&manager, &request("GET", "/api/syncs?x=1", "")).await;
        assert_eq!(response.body, json!({ "results": [] }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_errors_map_to_status_codes() {
        let (_tmp, manager) = manager();
        let invalid = route(&manager, &request("POST", "/api/sync", r#"{"path":"/missing"}"#)).await;
        assert_eq!(invalid.status, 400);
        assert_eq!(invalid.body, json!({ "error": "invalid path" }));

        let conflict = Response::from_sync_error(&SyncError::SyncInProgress);
        assert_eq!(conflict.status, 409);
        let failed = Response::from_sync_error(&SyncError::Command("listing command failed".into()));
        assert_eq!(failed.status, 500);
    }

    #[test]
    fn response_bytes_carry_length_and_close() {
        let bytes = Response::error(409, "sync already started").to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 409 Conflict\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        let body = r#"{"error":"sync already started"}"#;
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(text.ends_with(body));
    }
}
