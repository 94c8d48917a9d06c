use crate::config::AppConfig;
use crate::models::Destination;
use async_trait::async_trait;
use std::collections::HashMap;

const DISCORD_API: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_message_id: String,
    pub channel_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Chat bot '{0}' is not running or enabled")]
    UnknownBot(String),
    #[error("Unsupported destination")]
    InvalidDestination,
    #[error("chat api returned http_status:{status}: {body}")]
    Api { status: u16, body: String },
    #[error("chat api request error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat api returned an unexpected payload")]
    MalformedResponse,
}

/// Outbound reply seam. The relay core only depends on this trait; the
/// gateway-facing implementation lives below, test doubles in the test tree.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_text(
        &self,
        chat_bot_id: &str,
        destination: &Destination,
        content: &str,
        reply_to_chat_message_id: Option<&str>,
    ) -> Result<SentMessage, SendError>;
}

/// Sends outbound messages through the Discord REST API with each configured
/// bot's token. DM sends first open (or reuse) the recipient's DM channel.
pub struct DiscordRestSender {
    client: reqwest::Client,
    tokens: HashMap<String, String>,
}

impl DiscordRestSender {
    pub fn from_config(config: &AppConfig) -> Result<Self, crate::config::ConfigError> {
        let mut tokens = HashMap::new();
        for bot in &config.discord_bots {
            if bot.enabled {
                tokens.insert(bot.id.clone(), bot.resolved_token()?);
            }
        }
        Ok(DiscordRestSender {
            client: reqwest::Client::new(),
            tokens,
        })
    }

    async fn open_dm_channel(&self, token: &str, user_id: &str) -> Result<String, SendError> {
        let resp = self
            .client
            .post(format!("{DISCORD_API}/users/@me/channels"))
            .header("Authorization", format!("Bot {token}"))
            .json(&serde_json::json!({ "recipient_id": user_id }))
            .send()
            .await?;
        let body: serde_json::Value = check_status(resp).await?.json().await?;
        body["id"]
            .as_str()
            .map(String::from)
            .ok_or(SendError::MalformedResponse)
    }

    async fn post_message(
        &self,
        token: &str,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<SentMessage, SendError> {
        let mut payload = serde_json::json!({ "content": content });
        if let Some(message_id) = reply_to {
            payload["message_reference"] = serde_json::json!({ "message_id": message_id });
        }
        let resp = self
            .client
            .post(format!("{DISCORD_API}/channels/{channel_id}/messages"))
            .header("Authorization", format!("Bot {token}"))
            .json(&payload)
            .send()
            .await?;
        let body: serde_json::Value = check_status(resp).await?.json().await?;
        let chat_message_id = body["id"]
            .as_str()
            .map(String::from)
            .ok_or(SendError::MalformedResponse)?;
        Ok(SentMessage {
            chat_message_id,
            channel_id: Some(channel_id.to_string()),
        })
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(SendError::Api { status, body })
}

#[async_trait]
impl ChatSender for DiscordRestSender {
    async fn send_text(
        &self,
        chat_bot_id: &str,
        destination: &Destination,
        content: &str,
        reply_to_chat_message_id: Option<&str>,
    ) -> Result<SentMessage, SendError> {
        let token = self
            .tokens
            .get(chat_bot_id)
            .ok_or_else(|| SendError::UnknownBot(chat_bot_id.to_string()))?;

        match destination.kind.as_str() {
            "dm" => {
                let user_id = destination
                    .user_id
                    .as_deref()
                    .ok_or(SendError::InvalidDestination)?;
                let channel_id = self.open_dm_channel(token, user_id).await?;
                self.post_message(token, &channel_id, content, reply_to_chat_message_id)
                    .await
            }
            "channel" => {
                let channel_id = destination
                    .channel_id
                    .as_deref()
                    .ok_or(SendError::InvalidDestination)?;
                self.post_message(token, channel_id, content, reply_to_chat_message_id)
                    .await
            }
            _ => Err(SendError::InvalidDestination),
        }
    }
}
