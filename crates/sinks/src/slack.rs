//! Chat sink backed by Slack `chat.postMessage`.

use std::sync::Arc;

use kew_core::NotificationPayload;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";

/// Error string Slack returns for an unknown or inaccessible channel.
pub const CHANNEL_NOT_FOUND: &str = "channel_not_found";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("channel_not_found: {0}")]
    ChannelNotFound(String),
    #[error("slack api error: {0}")]
    Api(String),
    #[error("slack http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("slack config error: {0}")]
    Config(String),
}

/// Attachment colour for an event status.
pub fn color_for(status: &str) -> &'static str {
    match status {
        "Normal" => "good",
        "Warning" => "warning",
        _ => "danger",
    }
}

#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    async fn post_message(&self, channel: &str, title: &str, text: &str, color: &str) -> Result<(), ChatError>;
}

#[derive(Debug, Serialize)]
struct AttachmentField<'a> {
    title: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct Attachment<'a> {
    color: &'a str,
    fields: [AttachmentField<'a>; 1],
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    as_user: bool,
    attachments: [Attachment<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Minimal Slack Web API client.
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    api_url: String,
}

impl SlackClient {
    pub fn new(token: impl Into<String>, api_url: impl Into<String>) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30)).build()?;
        Ok(Self { http, token: token.into(), api_url: api_url.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait::async_trait]
impl ChatClient for SlackClient {
    async fn post_message(&self, channel: &str, title: &str, text: &str, color: &str) -> Result<(), ChatError> {
        let body = PostMessage {
            channel,
            as_user: true,
            attachments: [Attachment { color, fields: [AttachmentField { title, value: text }] }],
        };
        let resp = self
            .http
            .post(format!("{}/chat.postMessage", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChatError::Api(format!("http status {}", status)));
        }
        let parsed: SlackResponse = resp.json().await?;
        if parsed.ok {
            return Ok(());
        }
        match parsed.error.as_deref() {
            Some(CHANNEL_NOT_FOUND) => Err(ChatError::ChannelNotFound(channel.to_string())),
            Some(other) => Err(ChatError::Api(other.to_string())),
            None => Err(ChatError::Api("unknown error".to_string())),
        }
    }
}

/// Per-scope chat settings.
#[derive(Debug, Clone, Default)]
pub struct ChatConfig {
    pub enabled: bool,
    /// Channel for this scope (override or default).
    pub channel: String,
    /// Process-wide default channel used as fallback.
    pub default_channel: String,
}

pub struct ChatSink {
    client: Option<Arc<dyn ChatClient>>,
    cfg: ChatConfig,
}

impl ChatSink {
    pub fn new(client: Arc<dyn ChatClient>, cfg: ChatConfig) -> Self { Self { client: Some(client), cfg } }

    pub fn disabled() -> Self { Self { client: None, cfg: ChatConfig::default() } }

    pub fn is_enabled(&self) -> bool { self.cfg.enabled && self.client.is_some() }

    pub fn channel(&self) -> &str { &self.cfg.channel }

    /// Post to the scope channel; on `channel_not_found` try the default
    /// channel once.
    pub async fn post(&self, title: &str, text: &str, status: &str) -> Result<(), ChatError> {
        let Some(client) = self.client.as_ref().filter(|_| self.cfg.enabled) else { return Ok(()) };
        let color = color_for(status);
        match client.post_message(&self.cfg.channel, title, text, color).await {
            Err(ChatError::ChannelNotFound(ch)) if ch != self.cfg.default_channel && !self.cfg.default_channel.is_empty() => {
                info!(channel = %ch, fallback = %self.cfg.default_channel, "channel not found; posting to default channel");
                client.post_message(&self.cfg.default_channel, title, text, color).await
            }
            other => other,
        }
    }

    pub async fn notify(&self, payload: &NotificationPayload) -> Result<(), ChatError> {
        debug!(key = %payload.key, channel = %self.cfg.channel, "chat notify");
        self.post(&payload.title(), &payload.text, &payload.status).await
    }
}
