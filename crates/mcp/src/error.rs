//! Error types for the MCP client layer.

use thiserror::Error;

/// Errors from transports, the manager, and routed tool calls.
#[derive(Debug, Error)]
pub enum McpError {
    /// I/O failure on a subprocess transport
    #[error("I/O error on server '{server}': {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },

    /// HTTP failure on the SSE transport
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A frame failed to parse as JSON
    #[error("Failed to parse JSON-RPC frame: {0}")]
    Parse(#[from] serde_json::Error),

    /// The server returned a JSON-RPC error object
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A stdio response carried an unexpected id
    #[error("Response id mismatch on server '{server}': expected {expected}, got {got:?}")]
    IdMismatch {
        server: String,
        expected: i64,
        got: Option<i64>,
    },

    /// The SSE stream ended before the matching response arrived
    #[error("Stream from server '{server}' closed before response to request {id}")]
    StreamClosed { server: String, id: i64 },

    /// The call exceeded its deadline
    #[error("Call to '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    /// No server claims the tool
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Two servers advertised the same tool name
    #[error("Tool '{tool}' claimed by both '{first}' and '{second}'")]
    DuplicateTool {
        tool: String,
        first: String,
        second: String,
    },

    /// The subprocess exited and could not be restarted
    #[error("Server '{0}' is not running")]
    ServerClosed(String),

    /// Malformed server catalog entry
    #[error("Invalid server config for '{server}': {reason}")]
    InvalidConfig { server: String, reason: String },
}
