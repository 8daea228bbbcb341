//! MCP wire types: JSON-RPC 2.0 frames and the tool-call result shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name reported to servers in `initialize`.
pub const CLIENT_NAME: &str = "vigil";

/// An outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a request with the given id, method, and optional params.
    #[must_use]
    pub fn new(id: i64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// An inbound JSON-RPC frame.
///
/// Servers interleave responses with notifications on the SSE transport, so
/// a frame may carry a `method` (notification) instead of an `id` + result.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcFrame {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcFrame {
    /// A frame with a `method` and no `id` is a server-initiated
    /// notification, never the reply to a request.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.method.is_some() || self.id.is_none()
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Client identification sent in `initialize`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: CLIENT_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// One tool advertised by a server in `tools/list`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// One typed fragment of tool output.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
    #[serde(other)]
    Unknown,
}

/// Result of a `tools/call`.
///
/// `is_error` means the tool ran and reported failure; transport and
/// JSON-RPC level failures surface as [`crate::McpError`] instead.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    /// Concatenate the text fragments of the result.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for fragment in &self.content {
            if let Content::Text { text } = fragment {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// A successful single-text result.
    #[must_use]
    pub fn ok_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// An `isError` single-text result.
    #[must_use]
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_without_null_params() {
        let req = RpcRequest::new(1, "tools/list", None);
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains("params"));
        assert!(line.contains("\"jsonrpc\":\"2.0\""));
        assert!(line.contains("\"id\":1"));
    }

    #[test]
    fn test_frame_notification_detection() {
        let frame: RpcFrame = serde_json::from_value(json!({
            "method": "notifications/message",
            "params": {"level": "info"}
        }))
        .unwrap();
        assert!(frame.is_notification());

        let frame: RpcFrame = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [{"type": "text", "text": "ok"}]}
        }))
        .unwrap();
        assert!(!frame.is_notification());
        assert_eq!(frame.id, Some(3));
    }

    #[test]
    fn test_tool_result_text_joins_fragments() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "line two"}
            ]
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "line one\nline two");
    }

    #[test]
    fn test_tool_result_is_error_flag() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "boom");
    }
}
