//! Notification delivery: actually sends messages to the owner's linked channel.
//! Supports: Telegram Bot API, Discord Webhook, HTTP Webhook.

use std::sync::Arc;

use async_trait::async_trait;
use nudgeclaw_core::error::{DeliveryError, Result};
use nudgeclaw_core::traits::DeliveryChannel;
use serde::{Deserialize, Serialize};

/// Where an owner can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyTarget {
    /// Telegram Bot API: send via `sendMessage` to this chat.
    Telegram { chat_id: String },
    /// Discord Webhook URL.
    Discord { webhook_url: String },
    /// Generic HTTP webhook: POST with JSON body.
    Webhook {
        url: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
}

impl NotifyTarget {
    /// Short label for logs (never includes secrets).
    pub fn label(&self) -> &'static str {
        match self {
            NotifyTarget::Telegram { .. } => "telegram",
            NotifyTarget::Discord { .. } => "discord",
            NotifyTarget::Webhook { .. } => "webhook",
        }
    }
}

/// An owner's linked delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLink {
    pub owner_id: String,
    pub target: NotifyTarget,
}

/// Lookup of linked channels by owner.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn channel_for(&self, owner_id: &str) -> Result<Option<ChannelLink>>;
}

/// A message ready to be pushed.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Delivery over HTTP to whatever channel the owner linked.
pub struct HttpDelivery {
    directory: Arc<dyn ChannelDirectory>,
    telegram_bot_token: String,
    client: reqwest::Client,
}

impl HttpDelivery {
    pub fn new(directory: Arc<dyn ChannelDirectory>, telegram_bot_token: &str) -> Self {
        Self {
            directory,
            telegram_bot_token: telegram_bot_token.to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn dispatch(&self, notification: &Notification, target: &NotifyTarget) -> Result<(), String> {
        match target {
            NotifyTarget::Telegram { chat_id } => {
                if self.telegram_bot_token.is_empty() {
                    return Err("Telegram bot token not configured".into());
                }
                send_telegram(&self.client, &self.telegram_bot_token, chat_id, notification).await
            }
            NotifyTarget::Discord { webhook_url } => {
                send_discord(&self.client, webhook_url, notification).await
            }
            NotifyTarget::Webhook { url, headers } => {
                send_webhook(&self.client, url, headers, notification).await
            }
        }
    }
}

#[async_trait]
impl DeliveryChannel for HttpDelivery {
    async fn has_channel(&self, owner_id: &str) -> Result<bool, DeliveryError> {
        match self.directory.channel_for(owner_id).await {
            Ok(link) => Ok(link.is_some()),
            Err(e) => {
                tracing::warn!("⚠️ Channel lookup failed for {owner_id}: {e}");
                Err(DeliveryError::Failed(format!("channel lookup: {e}")))
            }
        }
    }

    async fn send(&self, owner_id: &str, text: &str) -> Result<(), DeliveryError> {
        let link = self
            .directory
            .channel_for(owner_id)
            .await
            .map_err(|e| DeliveryError::Failed(format!("channel lookup: {e}")))?
            .ok_or_else(|| DeliveryError::NoChannel(owner_id.to_string()))?;

        let notification = Notification::new("NudgeClaw", text);
        self.dispatch(&notification, &link.target)
            .await
            .map_err(DeliveryError::Failed)?;
        tracing::debug!("📨 Delivered to {owner_id} via {}", link.target.label());
        Ok(())
    }
}

/// Send notification via Telegram Bot API.
async fn send_telegram(
    client: &reqwest::Client,
    bot_token: &str,
    chat_id: &str,
    notification: &Notification,
) -> Result<(), String> {
    let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "chat_id": chat_id,
            "text": escape_markdown(&notification.body),
            "parse_mode": "Markdown"
        }))
        .send()
        .await
        .map_err(|e| format!("Telegram send failed: {e}"))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Telegram API error {status}: {body}"))
    }
}

/// Send notification via Discord Webhook.
async fn send_discord(
    client: &reqwest::Client,
    webhook_url: &str,
    notification: &Notification,
) -> Result<(), String> {
    let resp = client
        .post(webhook_url)
        .json(&serde_json::json!({
            "embeds": [{
                "title": notification.title,
                "description": notification.body,
                "color": 0x00AAFF,
                "footer": {
                    "text": notification.timestamp.format("%H:%M:%S UTC").to_string()
                }
            }]
        }))
        .send()
        .await
        .map_err(|e| format!("Discord send failed: {e}"))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Discord webhook error {status}: {body}"))
    }
}

/// Send notification via generic HTTP webhook.
async fn send_webhook(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    notification: &Notification,
) -> Result<(), String> {
    let mut req = client.post(url).json(&serde_json::json!({
        "title": notification.title,
        "body": notification.body,
        "timestamp": notification.timestamp.to_rfc3339(),
    }));

    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| format!("Webhook send failed: {e}"))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("Webhook error {}", resp.status()))
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}
