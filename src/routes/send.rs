use crate::discord::{ChatSender, SendError};
use crate::models::{SendMessageRequest, SendMessageResponse};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, post};
use std::collections::HashSet;
use std::sync::Arc;

use super::{ApiError, BackendAuth, bad_request};

/// Enabled chat bot IDs, for the 404-on-unknown-bot check.
pub struct ChatBots(pub HashSet<String>);

#[post("/v1/messages/send", format = "json", data = "<body>")]
pub async fn send_message(
    sender: &State<Arc<dyn ChatSender>>,
    chat_bots: &State<ChatBots>,
    _auth: BackendAuth,
    body: Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    if body.content.is_empty() {
        return Err(bad_request("content must not be empty"));
    }
    if let Err(detail) = body.destination.validate() {
        return Err(bad_request(detail));
    }
    if !chat_bots.0.contains(&body.chat_bot_id) {
        return Err((
            Status::NotFound,
            Json(serde_json::json!({
                "detail": format!("Chat bot '{}' not found or not enabled", body.chat_bot_id)
            })),
        ));
    }

    let sent = sender
        .send_text(
            &body.chat_bot_id,
            &body.destination,
            &body.content,
            body.reply_to_chat_message_id.as_deref(),
        )
        .await
        .map_err(|e| match e {
            SendError::UnknownBot(id) => (
                Status::NotFound,
                Json(serde_json::json!({
                    "detail": format!("Chat bot '{id}' not found or not enabled")
                })),
            ),
            SendError::InvalidDestination => bad_request("Unsupported destination"),
            other => {
                eprintln!("⚠️ Outbound send failed: {other}");
                (
                    Status::InternalServerError,
                    Json(serde_json::json!({ "detail": "Failed to send message" })),
                )
            }
        })?;

    Ok(Json(SendMessageResponse {
        chat_message_id: sent.chat_message_id,
        channel_id: sent.channel_id.or_else(|| body.destination.channel_id.clone()),
    }))
}
