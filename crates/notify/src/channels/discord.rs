//! Discord webhook sender.
//!
//! Discord targets carry the webhook path (`<id>/<token>`) as the channel
//! id when `DISCORD_WEBHOOK_URL` points at the API base; a fully-formed
//! webhook URL in the environment sends every message to that one webhook
//! regardless of channel id.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ChannelError;
use crate::ChannelSender;

/// Environment variable for the Discord webhook URL.
const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";

/// Discord message length limit; longer texts are truncated.
const MAX_MESSAGE_CHARS: usize = 2000;

/// Discord webhook sender.
pub struct DiscordSender {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

impl DiscordSender {
    /// Create a sender from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_DISCORD_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Discord sender enabled");
        } else {
            debug!("Discord sender disabled (DISCORD_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a sender with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelSender for DiscordSender {
    fn channel_type(&self) -> &'static str {
        "discord"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, _channel_id: &str, text: &str) -> Result<(), ChannelError> {
        let Some(url) = &self.webhook_url else {
            return Err(ChannelError::NotConfigured("discord".to_string()));
        };

        let content = if text.chars().count() > MAX_MESSAGE_CHARS {
            text.chars().take(MAX_MESSAGE_CHARS).collect::<String>()
        } else {
            text.to_string()
        };

        let response = self
            .client
            .post(url)
            .json(&WebhookPayload { content: &content })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!("Discord message sent");
        Ok(())
    }
}
