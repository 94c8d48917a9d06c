use crate::models::{
    AckRequest, AckResponse, LeaseRequest, LeaseResponse, NackRequest, NackResponse,
    PendingMessage, PendingMessagesResponse,
};
use crate::queue::QueueService;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use super::{ApiError, BackendAuth, bad_request, storage_error};

/// Legacy pull path: marks pending deliveries DELIVERED without a lease
/// (at-most-once). Deprecated in favor of lease/ack; kept for existing
/// consumers.
#[get("/v1/messages/pending?<limit>")]
pub fn get_pending_messages(
    queue: &State<QueueService>,
    auth: BackendAuth,
    limit: Option<i64>,
) -> Result<Json<PendingMessagesResponse>, ApiError> {
    let limit = limit.unwrap_or(50);
    if !(1..=100).contains(&limit) {
        return Err(bad_request("limit must be between 1 and 100"));
    }

    let deliveries = queue
        .fetch_and_mark_delivered(&auth.0.id, limit)
        .map_err(|e| storage_error("pending fetch", e))?;

    Ok(Json(PendingMessagesResponse {
        messages: deliveries.iter().map(PendingMessage::from).collect(),
    }))
}

#[post("/v1/messages/lease", format = "json", data = "<body>")]
pub fn lease_messages(
    queue: &State<QueueService>,
    auth: BackendAuth,
    body: Json<LeaseRequest>,
) -> Result<Json<LeaseResponse>, ApiError> {
    if !(1..=100).contains(&body.limit) {
        return Err(bad_request("limit must be between 1 and 100"));
    }
    if !(1..=3600).contains(&body.lease_seconds) {
        return Err(bad_request("lease_seconds must be between 1 and 3600"));
    }
    if !(1..=100).contains(&body.conversation_history_limit) {
        return Err(bad_request(
            "conversation_history_limit must be between 1 and 100",
        ));
    }

    let (leased, history) = queue
        .lease_messages(
            &auth.0.id,
            body.limit,
            body.lease_seconds,
            body.include_conversation_history,
            body.conversation_history_limit,
        )
        .map_err(|e| storage_error("lease", e))?;

    Ok(Json(LeaseResponse {
        messages: leased.iter().map(Into::into).collect(),
        conversation_history: body
            .include_conversation_history
            .then(|| history.iter().map(Into::into).collect()),
    }))
}

#[post("/v1/messages/ack", format = "json", data = "<body>")]
pub fn ack_messages(
    queue: &State<QueueService>,
    auth: BackendAuth,
    body: Json<AckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    if body.delivery_ids.is_empty() {
        return Err(bad_request("delivery_ids must not be empty"));
    }

    let acknowledged_count = queue
        .acknowledge(&auth.0.id, &body.delivery_ids, &body.lease_id)
        .map_err(|e| storage_error("ack", e))?;

    Ok(Json(AckResponse { acknowledged_count }))
}

#[post("/v1/messages/nack", format = "json", data = "<body>")]
pub fn nack_messages(
    queue: &State<QueueService>,
    auth: BackendAuth,
    body: Json<NackRequest>,
) -> Result<Json<NackResponse>, ApiError> {
    if body.delivery_ids.is_empty() {
        return Err(bad_request("delivery_ids must not be empty"));
    }

    let nacked_count = queue
        .negative_acknowledge(
            &auth.0.id,
            &body.delivery_ids,
            &body.lease_id,
            body.reason.as_deref(),
        )
        .map_err(|e| storage_error("nack", e))?;

    Ok(Json(NackResponse { nacked_count }))
}
