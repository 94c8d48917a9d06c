// Route module decomposition — each domain area in its own file.
// The bearer-token request guard and JSON catchers live here.

mod messages;
mod send;
mod system;

pub use messages::{ack_messages, get_pending_messages, lease_messages, nack_messages};
pub use send::{ChatBots, send_message};
pub use system::health;

use crate::auth::{AuthService, BackendIdentity};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;

/// Authenticated backend identity, resolved from `Authorization: Bearer`.
/// Guard failure surfaces as the 401 catcher below.
pub struct BackendAuth(pub BackendIdentity);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BackendAuth {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(auth_service) = req.rocket().state::<AuthService>() else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        if let Some(header) = req.headers().get_one("Authorization")
            && let Some(prefix) = header.get(..7)
            && prefix.eq_ignore_ascii_case("bearer ")
            && let Some(key) = header.get(7..)
            && let Some(backend) = auth_service.authenticate(key.trim())
        {
            return Outcome::Success(BackendAuth(backend.clone()));
        }
        Outcome::Error((Status::Unauthorized, ()))
    }
}

/// Handler error type: status plus a JSON `detail` body.
pub type ApiError = (Status, Json<serde_json::Value>);

pub fn bad_request(detail: impl Into<String>) -> ApiError {
    (
        Status::BadRequest,
        Json(serde_json::json!({ "detail": detail.into() })),
    )
}

pub fn storage_error(context: &str, error: rusqlite::Error) -> ApiError {
    eprintln!("⚠️ Storage error during {context}: {error}");
    (
        Status::InternalServerError,
        Json(serde_json::json!({ "detail": "Storage error" })),
    )
}

#[rocket::catch(400)]
pub fn catch_bad_request() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "detail": "Bad request" }))
}

#[rocket::catch(401)]
pub fn catch_unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "detail": "Unauthorized" }))
}

#[rocket::catch(404)]
pub fn catch_not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "detail": "Not found" }))
}

#[rocket::catch(422)]
pub fn catch_unprocessable() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "detail": "Validation error" }))
}

#[rocket::catch(500)]
pub fn catch_internal_error() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "detail": "Internal server error" }))
}
