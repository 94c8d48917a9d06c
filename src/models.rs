use serde::{Deserialize, Serialize};

// --- Persisted state encodings ---

/// Delivery lifecycle. Stored as the stable strings below; see the state
/// machine in `queue.rs` (only PENDING -> LEASED increments `attempts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Leased,
    Delivered,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Leased => "leased",
            DeliveryState::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryState::Pending),
            "leased" => Some(DeliveryState::Leased),
            "delivered" => Some(DeliveryState::Delivered),
            _ => None,
        }
    }
}

/// Webhook nudge lifecycle. SENDING is transient and owned by a dispatcher
/// worker; the upsert in `queue.rs` reclaims it back to PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeState {
    Pending,
    Sending,
    Failed,
}

impl NudgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NudgeState::Pending => "pending",
            NudgeState::Sending => "sending",
            NudgeState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NudgeState::Pending),
            "sending" => Some(NudgeState::Sending),
            "failed" => Some(NudgeState::Failed),
            _ => None,
        }
    }
}

// --- Queue records (internal product types, JSON only at the API boundary) ---

/// A captured chat message. Timestamps are RFC3339 UTC text, matching the
/// column encoding.
#[derive(Debug, Clone)]
pub struct ChatMessageRecord {
    pub chat_message_id: String,
    pub chat_bot_id: String,
    pub author_id: String,
    pub author_name: String,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub is_dm: bool,
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub backend_bot_id: String,
    pub message: ChatMessageRecord,
}

#[derive(Debug, Clone)]
pub struct LeasedDeliveryRecord {
    pub delivery_id: String,
    pub lease_id: String,
    pub backend_bot_id: String,
    pub message: ChatMessageRecord,
    pub lease_expires_at: String,
}

// --- REST wire schemas ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSource {
    pub is_dm: bool,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub author_id: String,
    pub author_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub chat_message_id: String,
    pub chat_bot_id: String,
    pub timestamp: String,
    pub content: String,
    pub source: MessageSource,
}

impl From<&ChatMessageRecord> for ChatMessagePayload {
    fn from(record: &ChatMessageRecord) -> Self {
        ChatMessagePayload {
            chat_message_id: record.chat_message_id.clone(),
            chat_bot_id: record.chat_bot_id.clone(),
            timestamp: record.timestamp.clone(),
            content: record.content.clone(),
            source: MessageSource {
                is_dm: record.is_dm,
                guild_id: record.guild_id.clone(),
                channel_id: record.channel_id.clone(),
                author_id: record.author_id.clone(),
                author_name: record.author_name.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingMessage {
    pub delivery_id: String,
    pub chat_bot_id: String,
    pub chat_message: ChatMessagePayload,
}

impl From<&DeliveryRecord> for PendingMessage {
    fn from(record: &DeliveryRecord) -> Self {
        PendingMessage {
            delivery_id: record.delivery_id.clone(),
            chat_bot_id: record.message.chat_bot_id.clone(),
            chat_message: (&record.message).into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingMessagesResponse {
    pub messages: Vec<PendingMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeasedMessage {
    pub delivery_id: String,
    pub lease_id: String,
    pub chat_bot_id: String,
    pub chat_message: ChatMessagePayload,
    pub lease_expires_at: String,
}

impl From<&LeasedDeliveryRecord> for LeasedMessage {
    fn from(record: &LeasedDeliveryRecord) -> Self {
        LeasedMessage {
            delivery_id: record.delivery_id.clone(),
            lease_id: record.lease_id.clone(),
            chat_bot_id: record.message.chat_bot_id.clone(),
            chat_message: (&record.message).into(),
            lease_expires_at: record.lease_expires_at.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaseRequest {
    #[serde(default = "default_lease_limit")]
    pub limit: i64,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
    #[serde(default)]
    pub include_conversation_history: bool,
    #[serde(default = "default_history_limit")]
    pub conversation_history_limit: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub messages: Vec<LeasedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ChatMessagePayload>>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub delivery_ids: Vec<String>,
    pub lease_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub acknowledged_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct NackRequest {
    pub delivery_ids: Vec<String>,
    pub lease_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NackResponse {
    pub nacked_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

impl Destination {
    /// Shape check: dm needs a user_id, channel needs a channel_id.
    pub fn validate(&self) -> Result<(), String> {
        match self.kind.as_str() {
            "dm" => {
                if self.user_id.as_deref().unwrap_or("").is_empty() {
                    return Err("user_id is required for dm destinations".to_string());
                }
            }
            "channel" => {
                if self.channel_id.as_deref().unwrap_or("").is_empty() {
                    return Err("channel_id is required for channel destinations".to_string());
                }
            }
            other => return Err(format!("destination type must be 'dm' or 'channel', got '{other}'")),
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub chat_bot_id: String,
    pub destination: Destination,
    pub content: String,
    #[serde(default)]
    pub reply_to_chat_message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub chat_message_id: String,
    pub channel_id: Option<String>,
}

fn default_lease_limit() -> i64 {
    50
}

fn default_lease_seconds() -> i64 {
    300
}

fn default_history_limit() -> i64 {
    20
}
