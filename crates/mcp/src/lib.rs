//! MCP client layer for Vigil.
//!
//! The [`McpManager`] owns every configured tool server: it starts each
//! transport, runs the `initialize` / `tools/list` handshake, and builds a
//! flat registry mapping tool name to owning server. Callers see one
//! operation, [`McpManager::call_tool`], routed to whichever transport
//! claims the tool.
//!
//! Two transports are supported: a child process speaking line-delimited
//! JSON-RPC on its standard streams, and an HTTP endpoint whose responses
//! arrive as Server-Sent-Event records.
//!
//! A tool name advertised by two servers is a startup error; the set of
//! tools is fixed for the life of the process.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::{ServerCatalog, ServerConfig};
pub use error::McpError;
pub use protocol::{ClientInfo, Content, ToolDescriptor, ToolResult, PROTOCOL_VERSION};
pub use transport::{McpTransport, SseTransport, StdioTransport};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can execute a named tool with JSON arguments.
///
/// The executor and the approval manager both hold this seam so tests can
/// substitute a fake for the real manager.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Invoke `name` with `args`, routed to the owning server.
    ///
    /// # Errors
    ///
    /// Transport, timeout, and JSON-RPC failures come back as [`McpError`];
    /// a result with `is_error` set means the tool itself reported failure.
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, McpError>;

    /// Whether any connected server claims the tool.
    fn has_tool(&self, name: &str) -> bool;
}

struct ServerHandle {
    name: String,
    transport: Arc<dyn McpTransport>,
    tools: Vec<ToolDescriptor>,
    initialized: AtomicBool,
}

/// Owns every configured tool server and the flat tool registry.
pub struct McpManager {
    servers: HashMap<String, Arc<ServerHandle>>,
    /// tool name -> server name; read-only after startup.
    registry: HashMap<String, String>,
    call_timeout: Duration,
}

impl std::fmt::Debug for McpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpManager").finish_non_exhaustive()
    }
}

impl McpManager {
    /// Connect to every server in the catalog: start the transport, run
    /// `initialize` and `tools/list`, and register the advertised tools.
    ///
    /// # Errors
    ///
    /// Fails fast on transport construction errors, handshake failures,
    /// and on a tool name claimed by two servers.
    pub async fn connect(
        catalog: &ServerCatalog,
        call_timeout: Duration,
    ) -> Result<Self, McpError> {
        let mut servers = HashMap::new();
        let mut registry: HashMap<String, String> = HashMap::new();

        for (name, server_config) in &catalog.servers {
            let transport: Arc<dyn McpTransport> = match server_config {
                ServerConfig::Stdio { command, args, env } => Arc::new(StdioTransport::new(
                    name.clone(),
                    command.clone(),
                    args.clone(),
                    env.clone(),
                )),
                ServerConfig::Sse { url, api_key } => {
                    Arc::new(SseTransport::new(name.clone(), url.clone(), api_key.as_deref())?)
                }
            };

            let handle = Self::open_server(name, transport).await?;
            for tool in &handle.tools {
                if let Some(first) = registry.get(&tool.name) {
                    return Err(McpError::DuplicateTool {
                        tool: tool.name.clone(),
                        first: first.clone(),
                        second: name.clone(),
                    });
                }
                registry.insert(tool.name.clone(), name.clone());
                debug!(tool = %tool.name, server = %name, "Tool registered");
            }
            servers.insert(name.clone(), Arc::new(handle));
        }

        info!(
            servers = servers.len(),
            tools = registry.len(),
            "MCP manager connected"
        );
        Ok(Self {
            servers,
            registry,
            call_timeout,
        })
    }

    async fn open_server(
        name: &str,
        transport: Arc<dyn McpTransport>,
    ) -> Result<ServerHandle, McpError> {
        let init = transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": ClientInfo::default(),
                })),
            )
            .await?;
        debug!(
            server = name,
            server_info = %init.get("serverInfo").unwrap_or(&serde_json::Value::Null),
            "MCP server initialized"
        );

        let listed = transport.request("tools/list", Some(json!({}))).await?;
        let tools: Vec<ToolDescriptor> = serde_json::from_value(
            listed.get("tools").cloned().unwrap_or(Value::Array(vec![])),
        )?;
        info!(server = name, tools = tools.len(), "MCP server tools listed");

        Ok(ServerHandle {
            name: name.to_string(),
            transport,
            tools,
            initialized: AtomicBool::new(true),
        })
    }

    /// Re-run `initialize` on a connected server. A no-op beyond protocol
    /// bookkeeping; the tool registry is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ServerClosed`] for unknown servers and any
    /// transport error from the handshake itself.
    pub async fn reinitialize(&self, server: &str) -> Result<(), McpError> {
        let handle = self
            .servers
            .get(server)
            .ok_or_else(|| McpError::ServerClosed(server.to_string()))?;
        handle
            .transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": ClientInfo::default(),
                })),
            )
            .await?;
        handle.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Every tool known to the registry, with its owning server.
    #[must_use]
    pub fn tools(&self) -> Vec<(&ToolDescriptor, &str)> {
        let mut out = Vec::new();
        for handle in self.servers.values() {
            for tool in &handle.tools {
                out.push((tool, handle.name.as_str()));
            }
        }
        out
    }

    /// Names of the connected servers.
    #[must_use]
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    /// Tear down every transport. Outstanding calls resolve as errors.
    pub async fn shutdown(&self) {
        info!(servers = self.servers.len(), "Shutting down MCP servers");
        for handle in self.servers.values() {
            handle.transport.shutdown().await;
            debug!(server = %handle.name, "MCP server shut down");
        }
    }
}

#[async_trait]
impl ToolDispatcher for McpManager {
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, McpError> {
        let server = self
            .registry
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;
        let handle = self
            .servers
            .get(server)
            .ok_or_else(|| McpError::ServerClosed(server.clone()))?;

        debug!(tool = name, server = %server, "Calling tool");
        let call = handle.transport.request(
            "tools/call",
            Some(json!({"name": name, "arguments": args})),
        );
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(tool = name, server = %server, error = %e, "Tool call failed");
                return Err(e);
            }
            Err(_) => {
                warn!(tool = name, server = %server, "Tool call timed out");
                return Err(McpError::Timeout {
                    tool: name.to_string(),
                    seconds: self.call_timeout.as_secs(),
                });
            }
        };

        let parsed: ToolResult = serde_json::from_value(result)?;
        debug!(tool = name, is_error = parsed.is_error, "Tool call completed");
        Ok(parsed)
    }

    fn has_tool(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }
}
