//! Server catalog configuration.
//!
//! Loaded as part of the engine configuration document under `mcp.servers`:
//!
//! ```json
//! {
//!   "servers": {
//!     "kubernetes": { "type": "stdio", "command": "vigil-k8s-mcp", "args": [], "env": {} },
//!     "cloud": { "type": "sse", "url": "https://mcp.example.com/rpc" }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The set of MCP servers the manager connects to at startup.
///
/// A `BTreeMap` keeps startup order deterministic, which in turn makes
/// duplicate-tool detection report the same pair on every start.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerCatalog {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Transport + endpoint for one MCP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConfig {
    /// Child process speaking line-delimited JSON-RPC on stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// HTTP endpoint returning SSE-framed JSON-RPC responses.
    Sse {
        url: String,
        #[serde(default, rename = "apiKey")]
        api_key: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_parses_both_transport_kinds() {
        let catalog: ServerCatalog = serde_json::from_str(
            r#"{
                "servers": {
                    "kubernetes": {"type": "stdio", "command": "vigil-k8s-mcp", "args": ["--json"], "env": {"KUBECONFIG": "/etc/kube"}},
                    "cloud": {"type": "sse", "url": "https://mcp.example.com/rpc", "apiKey": "secret"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.servers.len(), 2);
        match &catalog.servers["kubernetes"] {
            ServerConfig::Stdio { command, args, env } => {
                assert_eq!(command, "vigil-k8s-mcp");
                assert_eq!(args, &["--json"]);
                assert_eq!(env["KUBECONFIG"], "/etc/kube");
            }
            ServerConfig::Sse { .. } => panic!("expected stdio"),
        }
        match &catalog.servers["cloud"] {
            ServerConfig::Sse { url, api_key } => {
                assert_eq!(url, "https://mcp.example.com/rpc");
                assert_eq!(api_key.as_deref(), Some("secret"));
            }
            ServerConfig::Stdio { .. } => panic!("expected sse"),
        }
    }

    #[test]
    fn test_catalog_defaults_empty() {
        let catalog: ServerCatalog = serde_json::from_str("{}").unwrap();
        assert!(catalog.servers.is_empty());
    }
}
