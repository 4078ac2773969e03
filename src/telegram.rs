//! Telegram Bot API client
//!
//! Implements both external collaborators of the delivery pipeline:
//! the membership oracle (`getChatMember`) and the delivery transport
//! (`sendDocument`). The bot token comes from the environment:
//! - TELEGRAM_BOT_TOKEN

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryTransport, MembershipOracle};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Chat member statuses that count as channel membership.
const MEMBER_STATUSES: [&str; 3] = ["creator", "administrator", "member"];

/// Get the bot token from the environment
fn get_bot_token() -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
}

/// Response envelope shared by all Bot API methods
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    /// Set for "restricted" members; true means still in the chat.
    is_member: Option<bool>,
}

/// Whether a chat member record counts as belonging to the channel.
fn status_is_member(status: &str, is_member_flag: Option<bool>) -> bool {
    if MEMBER_STATUSES.contains(&status) {
        return true;
    }
    status == "restricted" && is_member_flag.unwrap_or(false)
}

pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl TelegramClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        let token = get_bot_token();
        if token.is_some() {
            info!("Telegram client initialized with bot token");
        } else {
            warn!("Telegram client initialized WITHOUT token - oracle and transport calls will fail");
        }
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            token,
        }
    }

    /// Check if a bot token is configured
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn method_url(&self, method: &str) -> Result<String> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN not set"))?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }
}

#[async_trait]
impl MembershipOracle for TelegramClient {
    async fn is_member(&self, user_id: &str, channel: &str) -> Result<bool> {
        let url = self.method_url("getChatMember")?;

        let response = self
            .client
            .get(&url)
            .query(&[("chat_id", channel), ("user_id", user_id)])
            .send()
            .await?;

        let status = response.status();
        let envelope: ApiEnvelope<ChatMember> = response.json().await?;

        if !envelope.ok {
            let description = envelope.description.unwrap_or_default();
            // "user not found" style answers mean the user simply is not
            // in the chat; only unexpected failures become oracle errors.
            if status.as_u16() == 400 {
                debug!(user_id, channel, "getChatMember: {}", description);
                return Ok(false);
            }
            anyhow::bail!("getChatMember failed ({}): {}", status, description);
        }

        let member = envelope
            .result
            .map(|m| status_is_member(&m.status, m.is_member))
            .unwrap_or(false);

        debug!(user_id, channel, member, "membership check");
        Ok(member)
    }
}

#[async_trait]
impl DeliveryTransport for TelegramClient {
    async fn send_document(&self, user_id: &str, filename: &str, path: &Path) -> Result<()> {
        let url = self.method_url("sendDocument")?;

        let bytes = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", user_id.to_string())
            .part("document", part);

        let response = self.client.post(&url).multipart(form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("sendDocument failed ({}): {}", status, body);
        }

        #[derive(Debug, Deserialize)]
        struct SentMessage {}

        let envelope: ApiEnvelope<SentMessage> = response.json().await?;
        if !envelope.ok {
            anyhow::bail!(
                "sendDocument rejected: {}",
                envelope.description.unwrap_or_default()
            );
        }

        debug!(user_id, filename, "document sent");
        Ok(())
    }
}
