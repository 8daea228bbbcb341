//! Transport implementations carrying JSON-RPC to one MCP server.

pub mod sse;
pub mod stdio;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpError;

/// One wire connection to an MCP server.
///
/// Implementations own request-id generation; callers see only the
/// `result` member of the matched response.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send one JSON-RPC request and await its response.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, frame parse failure, an id
    /// mismatch, or a JSON-RPC error object from the server.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    /// Tear the connection down. Outstanding calls resolve as errors.
    async fn shutdown(&self);
}
