use crate::config::LoadedConfig;
use rocket::serde::json::Json;
use rocket::{State, get};
use std::sync::Arc;

#[get("/v1/health")]
pub fn health(config: &State<Arc<LoadedConfig>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "config_path": config.path.display().to_string(),
    }))
}
