//! Engine configuration document.
//!
//! Loaded once at startup from a JSON file; every section has defaults so
//! a missing file or empty document yields a working (if quiet) engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vigil_mcp::ServerCatalog;

use crate::error::EngineError;

/// Top-level configuration for the engine process.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub watchloop: WatchLoopSettings,
    #[serde(default)]
    pub aiops: AiopsSettings,
    #[serde(default)]
    pub approval: ApprovalSettings,
    /// Per-call deadline for MCP tool invocations.
    #[serde(default = "default_tool_call_timeout")]
    pub tool_call_timeout_seconds: u64,
    /// How long shutdown waits for in-flight runs before cancelling them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub mcp: ServerCatalog,
}

/// Watch loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchLoopSettings {
    /// Master enable for background cluster observation.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll interval in seconds.
    #[serde(default = "default_watch_interval")]
    pub interval_seconds: u64,
}

impl Default for WatchLoopSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_watch_interval(),
        }
    }
}

/// Alerting and auto-remediation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AiopsSettings {
    /// `<type>:<id>` channel target for alerts and run progress.
    #[serde(default = "default_notification_channel")]
    pub notification_channel: String,
    /// When false the watch loop alerts but never launches runs.
    #[serde(default = "default_true")]
    pub auto_remediation: bool,
}

impl Default for AiopsSettings {
    fn default() -> Self {
        Self {
            notification_channel: default_notification_channel(),
            auto_remediation: true,
        }
    }
}

/// Approval handshake settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalSettings {
    /// TTL for a pending approval, in seconds.
    #[serde(default = "default_approval_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_approval_timeout(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_watch_interval() -> u64 {
    30
}

fn default_notification_channel() -> String {
    "slack:sre-alerts".to_string()
}

fn default_approval_timeout() -> u64 {
    900
}

fn default_tool_call_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl EngineConfig {
    /// Load the configuration document from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a config-class error (fatal at startup) when the file
    /// cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| EngineError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Watch loop poll interval.
    #[must_use]
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watchloop.interval_seconds.max(1))
    }

    /// Pending-approval TTL.
    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval.timeout_seconds.max(1))
    }

    /// Per-call tool deadline.
    #[must_use]
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_seconds.max(1))
    }

    /// Shutdown drain window.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}
