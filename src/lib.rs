pub mod auth;
pub mod config;
pub mod db;
pub mod discord;
pub mod ingress;
pub mod models;
pub mod queue;
pub mod reaper;
pub mod routes;
pub mod routing;
pub mod webhooks;

use auth::AuthService;
use config::{ConfigError, LoadedConfig};
use db::Db;
use discord::{ChatSender, DiscordRestSender};
use ingress::{IngressAdapter, IngressSender};
use queue::QueueService;
use routes::ChatBots;
use routing::RoutingTable;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Load config from `path` (or `RELAY_CONFIG` / `./config.yaml`) and build
/// the full service with the production Discord REST sender.
pub fn rocket_from_config_path(
    config_path: Option<&str>,
) -> Result<rocket::Rocket<rocket::Build>, ConfigError> {
    let loaded = config::load_config(config_path)?;
    let sender = DiscordRestSender::from_config(&loaded.data)?;
    build_rocket(loaded, Arc::new(sender))
}

/// Assemble the Rocket app over an already-loaded config and an injected
/// `ChatSender` (tests pass a recording double here). Background workers —
/// webhook dispatcher, lease reaper, ingress read loop — start on liftoff
/// and stop with the server.
pub fn build_rocket(
    loaded: LoadedConfig,
    sender: Arc<dyn ChatSender>,
) -> Result<rocket::Rocket<rocket::Build>, ConfigError> {
    let db_path = db::database_path(&loaded.data.storage.database_url);
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let db = Arc::new(Db::open(&db_path).map_err(|e| {
        ConfigError::Message(format!("Failed to open database '{db_path}': {e}"))
    })?);

    let routing = Arc::new(RoutingTable::new(&loaded.data)?);
    let auth_service = AuthService::new(&loaded.data)?;
    let debounce = queue::webhook_debounce_map(&loaded.data);
    let queue_service = QueueService::new(db.clone(), debounce.clone());

    let enabled_bots: HashMap<_, _> = loaded
        .data
        .discord_bots
        .iter()
        .filter(|bot| bot.enabled)
        .map(|bot| (bot.id.clone(), bot.clone()))
        .collect();
    let chat_bot_ids: HashSet<String> = enabled_bots.keys().cloned().collect();

    let webhook_configs: HashMap<_, _> = loaded
        .data
        .backend_bots
        .iter()
        .filter(|bot| bot.enabled)
        .filter_map(|bot| bot.webhook.clone().map(|w| (bot.id.clone(), w)))
        .collect();

    let (ingress_tx, ingress_rx) = tokio::sync::mpsc::channel(1024);
    let adapter = Arc::new(IngressAdapter::new(
        routing,
        QueueService::new(db, debounce),
        enabled_bots,
    ));

    let figment = rocket::Config::figment()
        .merge(("address", loaded.data.server.bind_host.clone()))
        .merge(("port", loaded.data.server.bind_port))
        .merge(("log_level", rocket_log_level(&loaded.data.server.log_level)?));

    let dispatcher_db_path = db_path.clone();
    let reaper_db_path = db_path;

    Ok(rocket::custom(figment)
        .manage(Arc::new(loaded))
        .manage(queue_service)
        .manage(auth_service)
        .manage(ChatBots(chat_bot_ids))
        .manage(sender)
        .manage(IngressSender(ingress_tx))
        .register(
            "/",
            rocket::catchers![
                routes::catch_bad_request,
                routes::catch_unauthorized,
                routes::catch_not_found,
                routes::catch_unprocessable,
                routes::catch_internal_error,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::get_pending_messages,
                routes::lease_messages,
                routes::ack_messages,
                routes::nack_messages,
                routes::send_message,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Webhook Dispatcher",
            move |_rocket| {
                Box::pin(async move {
                    webhooks::spawn_dispatcher(
                        dispatcher_db_path,
                        webhook_configs,
                        webhooks::DEFAULT_POLL_INTERVAL_SECONDS,
                    );
                    println!("🔗 Webhook dispatcher started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Lease Reaper",
            move |_rocket| {
                Box::pin(async move {
                    reaper::spawn_reaper(reaper_db_path);
                    println!("♻️ Lease reaper started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Chat Ingress",
            move |_rocket| {
                Box::pin(async move {
                    ingress::spawn_ingress_loop(ingress_rx, adapter);
                    println!("📨 Chat ingress loop started");
                })
            },
        )))
}

/// Map the config's log level names onto Rocket's figment values.
fn rocket_log_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "error" | "warn" | "warning" | "critical" => Ok("critical"),
        "info" | "normal" => Ok("normal"),
        "debug" | "trace" => Ok("debug"),
        "off" => Ok("off"),
        other => Err(ConfigError::Message(format!(
            "Unknown server.log_level '{other}' (expected error, warning, info, debug, or off)"
        ))),
    }
}
