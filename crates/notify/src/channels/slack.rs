//! Slack Web API sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChannelError;
use crate::ChannelSender;

/// Environment variable for the Slack bot token.
const ENV_SLACK_BOT_TOKEN: &str = "SLACK_BOT_TOKEN";

/// Slack Web API sender (`chat.postMessage`).
pub struct SlackSender {
    token: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackSender {
    /// Create a sender from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let token = std::env::var(ENV_SLACK_BOT_TOKEN).ok();

        if token.is_some() {
            debug!("Slack sender enabled");
        } else {
            debug!("Slack sender disabled (SLACK_BOT_TOKEN not set)");
        }

        Self {
            token,
            api_base: "https://slack.com/api".to_string(),
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
impl ChannelSender for SlackSender {
    fn channel_type(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.token.is_some()
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        let Some(token) = &self.token else {
            return Err(ChannelError::NotConfigured("slack".to_string()));
        };

        let url = format!("{}/chat.postMessage", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&PostMessageRequest {
                channel: channel_id,
                text,
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

        let body: PostMessageResponse = response.json().await?;
        if !body.ok {
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                message: body.error.unwrap_or_else(|| "unknown_error".to_string()),
            });
        }

        debug!(channel = channel_id, "Slack message sent");
        Ok(())
    }
}
