//! Chat channel delivery for Vigil.
//!
//! The engine composes its own messages (incident alerts, run progress,
//! approval prompts); this crate only delivers them. Each chat service is a
//! [`ChannelSender`] implementation; the [`ChannelRouter`] routes a message
//! to the right sender based on a [`ChannelTarget`] of the form
//! `<channel_type>:<channel_id>` (e.g. `slack:C024SRE`).
//!
//! # Usage
//!
//! ```no_run
//! use vigil_notify::{ChannelRouter, ChannelTarget};
//!
//! # async fn run() {
//! let router = ChannelRouter::from_env();
//! let target: ChannelTarget = "slack:C024SRE".parse().unwrap();
//! router.send(&target, "pod nginx-abc is in CrashLoopBackOff").await.ok();
//! # }
//! ```
//!
//! # Configuration
//!
//! Senders are auto-detected from environment variables:
//!
//! - `TELEGRAM_BOT_TOKEN`: enables the Telegram sender
//! - `SLACK_BOT_TOKEN`: enables the Slack sender
//! - `DISCORD_WEBHOOK_URL`: enables the Discord sender

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;

pub use channels::discord::DiscordSender;
pub use channels::slack::SlackSender;
pub use channels::telegram::TelegramSender;
pub use channels::ChannelSender;
pub use error::ChannelError;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A `<channel_type>:<channel_id>` destination for outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    /// Registered sender type (`telegram`, `slack`, `discord`, ...).
    pub channel_type: String,
    /// Sender-specific identifier (chat id, channel id, ...).
    pub channel_id: String,
}

impl ChannelTarget {
    /// Build a target from its two halves.
    #[must_use]
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

impl FromStr for ChannelTarget {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel_type, channel_id) = s
            .split_once(':')
            .ok_or_else(|| ChannelError::InvalidTarget(s.to_string()))?;
        if channel_type.is_empty() || channel_id.is_empty() {
            return Err(ChannelError::InvalidTarget(s.to_string()));
        }
        Ok(Self::new(channel_type, channel_id))
    }
}

/// Routes outbound messages to the sender registered for the target's type.
///
/// Send failures are the caller's to interpret; the router itself never
/// retries. Callers in the engine treat delivery errors as non-fatal and
/// log them.
pub struct ChannelRouter {
    senders: HashMap<String, Arc<dyn ChannelSender>>,
}

impl ChannelRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }

    /// Create a router with every sender that is configured in the
    /// environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut router = Self::new();

        let telegram = TelegramSender::from_env();
        if telegram.enabled() {
            info!("Telegram sender enabled");
            router.register(Arc::new(telegram));
        }

        let slack = SlackSender::from_env();
        if slack.enabled() {
            info!("Slack sender enabled");
            router.register(Arc::new(slack));
        }

        let discord = DiscordSender::from_env();
        if discord.enabled() {
            info!("Discord sender enabled");
            router.register(Arc::new(discord));
        }

        if router.senders.is_empty() {
            warn!("No chat senders configured; notifications will be dropped");
        }

        router
    }

    /// Register a sender under its channel type. A later registration for
    /// the same type replaces the earlier one.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        self.senders
            .insert(sender.channel_type().to_string(), sender);
    }

    /// Channel types currently registered.
    #[must_use]
    pub fn channel_types(&self) -> Vec<&str> {
        self.senders.keys().map(String::as_str).collect()
    }

    /// Deliver `text` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConfigured`] when no sender is registered
    /// for the target's type, or the sender's own error on delivery failure.
    pub async fn send(&self, target: &ChannelTarget, text: &str) -> Result<(), ChannelError> {
        let Some(sender) = self.senders.get(&target.channel_type) else {
            warn!(
                channel_type = %target.channel_type,
                "Dropping message for unregistered channel type"
            );
            return Err(ChannelError::NotConfigured(target.channel_type.clone()));
        };
        debug!(target = %target, bytes = text.len(), "Sending channel message");
        sender.send(&target.channel_id, text).await
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}
