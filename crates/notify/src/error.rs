//! Error types for channel delivery.

use thiserror::Error;

/// Errors that can occur when sending messages to a chat service.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No sender registered for the channel type
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Target string did not parse as `<type>:<id>`
    #[error("Invalid channel target: {0}")]
    InvalidTarget(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service rejected the message
    #[error("Service rejected message: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Rate limited by the service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}
