//! Engine error types.
//!
//! Config-class errors are fatal at startup; everything else is captured
//! into run records or logged at the loop that observed it.

use thiserror::Error;
use vigil_mcp::McpError;

/// Errors surfaced by engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or inconsistent configuration; refuses startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not read the configuration document
    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not parse the configuration document
    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A run was requested for a playbook id that is not registered
    #[error("Unknown playbook: {0}")]
    UnknownPlaybook(String),

    /// A registered step references a tool no server provides
    #[error("Step '{step}' in playbook '{playbook}' references unknown tool '{tool}'")]
    UnknownTool {
        playbook: String,
        step: String,
        tool: String,
    },

    /// The pending-approval store is at capacity
    #[error("Pending approval store is full")]
    StoreFull,

    /// Failure in the MCP layer
    #[error(transparent)]
    Mcp(#[from] McpError),
}
