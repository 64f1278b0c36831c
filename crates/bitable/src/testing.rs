//! In-process mock of the Open API for unit tests.
//!
//! Routes requests by method and path, replays queued responses (the last
//! queued response for a route repeats) and records every request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::BitableConfig;

pub(crate) const TOKEN_PATH: &str = "/auth/v3/tenant_access_token/internal";
pub(crate) const PREPARE_PATH: &str = "/drive/v1/medias/upload_prepare";
pub(crate) const PART_PATH: &str = "/drive/v1/medias/upload_part";
pub(crate) const FINISH_PATH: &str = "/drive/v1/medias/upload_finish";

pub(crate) fn fields_path(app_token: &str, table_id: &str) -> String {
    format!("/bitable/v1/apps/{app_token}/tables/{table_id}/fields")
}

pub(crate) fn batch_create_path(app_token: &str, table_id: &str) -> String {
    format!("/bitable/v1/apps/{app_token}/tables/{table_id}/records/batch_create")
}

#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    status: u16,
    body: String,
    delay: Option<Duration>,
}

impl MockResponse {
    pub(crate) fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: None,
        }
    }

    /// `{"code": 0, "msg": "success", "data": data}` with HTTP 200.
    pub(crate) fn ok(data: serde_json::Value) -> Self {
        Self::json(
            200,
            serde_json::json!({"code": 0, "msg": "success", "data": data}),
        )
    }

    pub(crate) fn api_error(status: u16, code: i64, msg: &str) -> Self {
        Self::json(status, serde_json::json!({"code": code, "msg": msg}))
    }

    pub(crate) fn token(token: &str, expire: i64) -> Self {
        Self::json(
            200,
            serde_json::json!({
                "code": 0,
                "msg": "ok",
                "tenant_access_token": token,
                "expire": expire,
            }),
        )
    }

    #[must_use]
    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub(crate) fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is not JSON")
    }

    /// Value of a `multipart/form-data` field.
    pub(crate) fn multipart_field(&self, name: &str) -> Option<Vec<u8>> {
        let marker = format!("name=\"{name}\"");
        let start = find(&self.body, marker.as_bytes())?;
        let header_end = start + find(&self.body[start..], b"\r\n\r\n")? + 4;
        let value_len = find(&self.body[header_end..], b"\r\n--")?;
        Some(self.body[header_end..header_end + value_len].to_vec())
    }

    pub(crate) fn multipart_text(&self, name: &str) -> Option<String> {
        self.multipart_field(name)
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }
}

#[derive(Default)]
struct MockState {
    routes: HashMap<(String, String), VecDeque<MockResponse>>,
    requests: Vec<RecordedRequest>,
}

pub(crate) struct MockApi {
    base_url: String,
    state: Arc<Mutex<MockState>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockApi {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://127.0.0.1:{port}");
        let state = Arc::new(Mutex::new(MockState::default()));

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self {
            base_url,
            state,
            handle,
        }
    }

    pub(crate) fn config(&self) -> BitableConfig {
        BitableConfig::new("cli_test", "secret_test").with_base_url(&self.base_url)
    }

    /// Queue a response for `method path`.
    pub(crate) fn on(&self, method: &str, path: &str, response: MockResponse) -> &Self {
        self.state
            .lock()
            .routes
            .entry((method.to_owned(), path.to_owned()))
            .or_default()
            .push_back(response);
        self
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub(crate) fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub(crate) fn hits(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<MockState>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_owned(), Some(q.to_owned())),
        None => (target, None),
    };

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_owned()))
        .collect();

    let mut body = buf[header_end..].to_vec();
    if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        while find(&body, b"0\r\n\r\n").is_none() {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body = decode_chunked(&body);
    } else {
        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    let response = {
        let mut state = state.lock();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            path: path.clone(),
            query,
            headers,
            body,
        });
        state
            .routes
            .get_mut(&(method, path))
            .and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
            .unwrap_or_else(|| MockResponse::api_error(404, 404, "no route"))
    };

    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }

    let reply = format!(
        "HTTP/1.1 {} MOCK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        response.body.len(),
        response.body
    );
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await
}

fn decode_chunked(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(line_end) = find(rest, b"\r\n") {
        let size_hex = String::from_utf8_lossy(&rest[..line_end]);
        let size = usize::from_str_radix(size_hex.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[start + size + 2..];
    }
    out
}
