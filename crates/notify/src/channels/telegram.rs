//! Telegram Bot API sender.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ChannelError;
use crate::ChannelSender;

/// Environment variable for the Telegram bot token.
const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";

/// Telegram message length limit; longer texts are truncated.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram Bot API sender (`sendMessage`).
pub struct TelegramSender {
    token: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

impl TelegramSender {
    /// Create a sender from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let token = std::env::var(ENV_TELEGRAM_BOT_TOKEN).ok();

        if token.is_some() {
            debug!("Telegram sender enabled");
        } else {
            debug!("Telegram sender disabled (TELEGRAM_BOT_TOKEN not set)");
        }

        Self {
            token,
            api_base: "https://api.telegram.org".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a sender with an explicit token and API base URL.
    #[must_use]
    pub fn new(token: String, api_base: String) -> Self {
        Self {
            token: Some(token),
            api_base,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    fn enabled(&self) -> bool {
        self.token.is_some()
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        let Some(token) = &self.token else {
            return Err(ChannelError::NotConfigured("telegram".to_string()));
        };

        let text = if text.chars().count() > MAX_MESSAGE_CHARS {
            text.chars().take(MAX_MESSAGE_CHARS).collect::<String>()
        } else {
            text.to_string()
        };

        let url = format!("{}/bot{token}/sendMessage", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: channel_id,
                text: &text,
                parse_mode: "Markdown",
            })
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

        debug!(chat_id = channel_id, "Telegram message sent");
        Ok(())
    }
}
