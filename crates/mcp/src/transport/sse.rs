//! SSE transport: JSON-RPC over HTTP POST with Server-Sent-Event framing.
//!
//! Each call POSTs one JSON-RPC request and streams the response body,
//! which arrives as `event: message` / `data: <json>` records. Servers may
//! interleave `notifications/*` records before the response; the scanner
//! skips anything whose id does not match the in-flight request.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::protocol::{RpcFrame, RpcRequest};
use crate::transport::McpTransport;

/// Incremental splitter for an SSE byte stream.
///
/// Feeds of arbitrary chunk boundaries come out as complete `data:`
/// payload lines; `event:` lines, comments, and blank separators are
/// discarded.
#[derive(Debug, Default)]
pub struct SseScanner {
    buf: String,
}

impl SseScanner {
    /// Create an empty scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the `data:` payloads completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        payloads
    }
}

/// Decide whether one `data:` payload is the response to request `id`.
///
/// Returns the `result` value on a match, `None` for notifications,
/// unparseable records, and responses to other ids, and an error when the
/// matching record carries a JSON-RPC error object.
fn response_from_payload(
    server: &str,
    payload: &str,
    id: i64,
) -> Result<Option<Value>, McpError> {
    let frame: RpcFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(server, error = %e, "Skipping unparseable SSE record");
            return Ok(None);
        }
    };
    if frame.is_notification() {
        debug!(
            server,
            method = frame.method.as_deref().unwrap_or(""),
            "Skipping server notification record"
        );
        return Ok(None);
    }
    if frame.id != Some(id) {
        return Ok(None);
    }
    if let Some(err) = frame.error {
        return Err(McpError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    Ok(Some(frame.result.unwrap_or(Value::Null)))
}

/// JSON-RPC over HTTP POST with SSE-framed responses.
pub struct SseTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicI64,
}

impl SseTransport {
    /// Create a transport for one SSE endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        server: impl Into<String>,
        url: impl Into<String>,
        api_key: Option<&str>,
    ) -> Result<Self, McpError> {
        let server = server.into();
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Some(key) = api_key {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| McpError::InvalidConfig {
                    server: server.clone(),
                    reason: "api key is not a valid header value".to_string(),
                })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            server,
            url: url.into(),
            client,
            next_id: AtomicI64::new(0),
        })
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = RpcRequest::new(id, method, params);

        debug!(server = %self.server, method, id, "Sending SSE request");
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut scanner = SseScanner::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for payload in scanner.push(&chunk) {
                if let Some(result) = response_from_payload(&self.server, &payload, id)? {
                    debug!(server = %self.server, method, id, "SSE response matched");
                    return Ok(result);
                }
            }
        }

        Err(McpError::StreamClosed {
            server: self.server.clone(),
            id,
        })
    }

    async fn shutdown(&self) {
        // Dropping the reqwest client closes its pool; nothing else held.
        debug!(server = %self.server, "SSE transport closed");
    }
}
