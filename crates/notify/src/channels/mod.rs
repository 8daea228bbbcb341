//! Channel sender implementations.

pub mod discord;
pub mod slack;
pub mod telegram;

use async_trait::async_trait;

use crate::error::ChannelError;

/// Trait for chat channel senders (Telegram, Slack, Discord, ...).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// The channel type this sender handles; the first half of a
    /// `<type>:<id>` target.
    fn channel_type(&self) -> &'static str;

    /// Check if this sender is configured.
    fn enabled(&self) -> bool;

    /// Deliver a plain-text message to the given channel id.
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError>;
}
