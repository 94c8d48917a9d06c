use crate::config::DiscordBotConfig;
use crate::models::ChatMessageRecord;
use crate::queue::QueueService;
use crate::routing::{MessageContext, RoutingTable};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A platform event normalized by the gateway client before it reaches the
/// core. Timestamps arrive as real datetimes; persistence formats them.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_bot_id: String,
    pub chat_message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_is_bot: bool,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub is_dm: bool,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Managed handle the gateway client uses to feed events into the relay.
pub struct IngressSender(pub mpsc::Sender<IncomingMessage>);

/// Filters and routes normalized platform events into the delivery queue.
pub struct IngressAdapter {
    routing: Arc<RoutingTable>,
    queue: QueueService,
    bots: HashMap<String, DiscordBotConfig>,
}

impl IngressAdapter {
    pub fn new(
        routing: Arc<RoutingTable>,
        queue: QueueService,
        bots: HashMap<String, DiscordBotConfig>,
    ) -> Self {
        IngressAdapter {
            routing,
            queue,
            bots,
        }
    }

    /// Ingest one event. Returns true when a new message was enqueued.
    ///
    /// Messages from bot accounts are never ingested. The channel allowlist
    /// gates guild/channel traffic only; DMs are always ingested.
    pub fn handle_message(&self, msg: &IncomingMessage) -> bool {
        let Some(bot) = self.bots.get(&msg.chat_bot_id) else {
            return false;
        };
        if msg.author_is_bot {
            return false;
        }
        if !msg.is_dm {
            let allowed = msg
                .channel_id
                .as_deref()
                .is_some_and(|channel| bot.channel_allowlist.iter().any(|c| c == channel));
            if !allowed {
                // Not ingesting from this channel.
                return false;
            }
        }

        let ctx = MessageContext {
            chat_bot_id: &msg.chat_bot_id,
            author_id: &msg.author_id,
            channel_id: msg.channel_id.as_deref(),
            guild_id: msg.guild_id.as_deref(),
            is_dm: msg.is_dm,
        };
        let Some(backend_id) = self.routing.resolve_backend(&ctx) else {
            return false;
        };

        let dedupe_key = format!("{}:{}", msg.chat_bot_id, msg.chat_message_id);
        let payload = ChatMessageRecord {
            chat_message_id: msg.chat_message_id.clone(),
            chat_bot_id: msg.chat_bot_id.clone(),
            author_id: msg.author_id.clone(),
            author_name: msg.author_name.clone(),
            channel_id: msg.channel_id.clone(),
            guild_id: msg.guild_id.clone(),
            is_dm: msg.is_dm,
            content: msg.content.clone(),
            timestamp: msg.timestamp.to_rfc3339(),
        };
        match self.queue.enqueue_message(&backend_id, &payload, &dedupe_key) {
            Ok(inserted) => inserted,
            Err(e) => {
                eprintln!(
                    "⚠️ Failed to enqueue message {} from bot {}: {e}",
                    msg.chat_message_id, msg.chat_bot_id
                );
                false
            }
        }
    }
}

/// Spawns the ingress read loop: consumes normalized events from the gateway
/// side of the channel until every sender is dropped.
pub fn spawn_ingress_loop(mut receiver: mpsc::Receiver<IncomingMessage>, adapter: Arc<IngressAdapter>) {
    tokio::spawn(async move {
        while let Some(msg) = receiver.recv().await {
            adapter.handle_message(&msg);
        }
    });
}
