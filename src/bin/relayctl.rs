//! `relayctl` — REST client for the relay server.

use clap::{ArgGroup, Args, Parser, Subcommand};
use discord_relay::config::{ConfigError, LoadedConfig, load_config};
use std::process::exit;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_AUTH: i32 = 10;
const EXIT_NETWORK: i32 = 20;
const EXIT_SERVER: i32 = 30;

#[derive(Parser)]
#[command(name = "relayctl", about = "Relay REST client.")]
struct Cli {
    /// Path to relay config YAML (falls back to RELAY_CONFIG).
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<String>,
    /// Backend bot ID.
    #[arg(long, env = "RELAY_BACKEND_ID")]
    backend_id: Option<String>,
    /// Relay server base URL (falls back to config.server.base_url).
    #[arg(long, env = "RELAY_BASE_URL")]
    base_url: Option<String>,
    /// API key for the backend bot (falls back to the config backend).
    #[arg(long, env = "RELAY_API_KEY")]
    api_key: Option<String>,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,
    /// Pretty-print JSON output.
    #[arg(long)]
    pretty: bool,
    /// Suppress informational logging on stderr.
    #[arg(long)]
    quiet: bool,
    /// Optional request ID forwarded via X-Request-Id.
    #[arg(long)]
    request_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch pending messages (legacy pull; marks them delivered).
    Retrieve {
        /// Maximum number of pending messages (1-100).
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Send a message on behalf of a backend bot.
    Send(SendArgs),
    /// Lease pending messages for processing.
    Lease {
        /// Maximum number of messages to lease (1-100).
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Lease duration in seconds (1-3600).
        #[arg(long, default_value_t = 300)]
        lease_seconds: i64,
        /// Include conversation history in the response.
        #[arg(long)]
        include_history: bool,
        /// Maximum conversation history messages (1-100).
        #[arg(long, default_value_t = 20)]
        history_limit: i64,
    },
    /// Acknowledge successful processing of leased messages.
    Ack {
        #[arg(long, required = true, num_args = 1..)]
        delivery_ids: Vec<String>,
        #[arg(long)]
        lease_id: String,
    },
    /// Negative-acknowledge failed processing of leased messages.
    Nack {
        #[arg(long, required = true, num_args = 1..)]
        delivery_ids: Vec<String>,
        #[arg(long)]
        lease_id: String,
        /// Optional reason for the nack.
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("destination").required(true).multiple(false)))]
struct SendArgs {
    /// Chat bot ID to use when delivering the message.
    #[arg(long)]
    chat_bot_id: String,
    /// DM user ID.
    #[arg(long, group = "destination")]
    dm_user_id: Option<String>,
    /// Channel ID.
    #[arg(long, group = "destination")]
    channel_id: Option<String>,
    /// Message text to deliver.
    #[arg(long)]
    content: String,
    /// Chat message ID to reply to.
    #[arg(long)]
    reply_to: Option<String>,
}

struct ConnectionSettings {
    base_url: String,
    api_key: String,
}

fn main() {
    let cli = Cli::parse();
    exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if cli.timeout <= 0.0 {
        eprintln!("--timeout must be positive");
        return EXIT_USAGE;
    }
    match validate_ranges(&cli.command) {
        Ok(()) => {}
        Err(message) => {
            eprintln!("{message}");
            return EXIT_USAGE;
        }
    }

    let settings = match resolve_connection(&cli) {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_USAGE;
        }
    };

    let client = match reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs_f64(cli.timeout))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {e}");
            return EXIT_NETWORK;
        }
    };

    run_command(&cli, &settings, &client)
}

fn validate_ranges(command: &Command) -> Result<(), String> {
    let check = |value: i64, low: i64, high: i64, name: &str| {
        if (low..=high).contains(&value) {
            Ok(())
        } else {
            Err(format!("{name} must be between {low} and {high}"))
        }
    };
    match command {
        Command::Retrieve { limit } => check(*limit, 1, 100, "--limit"),
        Command::Lease {
            limit,
            lease_seconds,
            history_limit,
            ..
        } => {
            check(*limit, 1, 100, "--limit")?;
            check(*lease_seconds, 1, 3600, "--lease-seconds")?;
            check(*history_limit, 1, 100, "--history-limit")
        }
        _ => Ok(()),
    }
}

/// Determine base URL and API key from flags, env, or the config file.
fn resolve_connection(cli: &Cli) -> Result<ConnectionSettings, String> {
    let loaded: Option<LoadedConfig> = match &cli.config {
        Some(path) => Some(
            load_config(Some(path)).map_err(|e: ConfigError| format!("Failed to load config: {e}"))?,
        ),
        None => None,
    };

    let mut base_url = cli.base_url.clone();
    let mut api_key = cli.api_key.clone();

    if let Some(loaded) = &loaded {
        let backend_id = cli
            .backend_id
            .as_deref()
            .ok_or("--backend-id is required when --config is provided")?;
        let backend = loaded
            .data
            .backend_bots
            .iter()
            .find(|bot| bot.id == backend_id)
            .ok_or_else(|| format!("Backend '{backend_id}' not found in config"))?;
        if api_key.is_none() {
            api_key = Some(backend.resolved_api_key().map_err(|e| e.to_string())?);
        }
        if base_url.is_none() {
            base_url = loaded.data.server.base_url.clone();
        }
    }

    let base_url = base_url
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
        .trim_end_matches('/')
        .to_string();
    let api_key = api_key.ok_or(
        "API key is required (--api-key, RELAY_API_KEY, or backend config api_key)",
    )?;

    Ok(ConnectionSettings { base_url, api_key })
}

fn run_command(
    cli: &Cli,
    settings: &ConnectionSettings,
    client: &reqwest::blocking::Client,
) -> i32 {
    let log = |message: String| {
        if !cli.quiet {
            eprintln!("{message}");
        }
    };

    let request = match &cli.command {
        Command::Retrieve { limit } => {
            log(format!("Retrieving up to {limit} pending messages..."));
            client
                .get(format!("{}/v1/messages/pending", settings.base_url))
                .query(&[("limit", limit)])
        }
        Command::Send(args) => {
            let (kind, destination) = if let Some(user_id) = &args.dm_user_id {
                ("dm", serde_json::json!({ "type": "dm", "user_id": user_id }))
            } else {
                (
                    "channel",
                    serde_json::json!({ "type": "channel", "channel_id": args.channel_id }),
                )
            };
            log(format!(
                "Sending message via {} to {kind}",
                args.chat_bot_id
            ));
            let mut payload = serde_json::json!({
                "chat_bot_id": args.chat_bot_id,
                "destination": destination,
                "content": args.content,
            });
            if let Some(reply_to) = &args.reply_to {
                payload["reply_to_chat_message_id"] = serde_json::json!(reply_to);
            }
            client
                .post(format!("{}/v1/messages/send", settings.base_url))
                .json(&payload)
        }
        Command::Lease {
            limit,
            lease_seconds,
            include_history,
            history_limit,
        } => {
            log(format!("Leasing up to {limit} messages..."));
            client
                .post(format!("{}/v1/messages/lease", settings.base_url))
                .json(&serde_json::json!({
                    "limit": limit,
                    "lease_seconds": lease_seconds,
                    "include_conversation_history": include_history,
                    "conversation_history_limit": history_limit,
                }))
        }
        Command::Ack {
            delivery_ids,
            lease_id,
        } => {
            log(format!("Acknowledging {} message(s)...", delivery_ids.len()));
            client
                .post(format!("{}/v1/messages/ack", settings.base_url))
                .json(&serde_json::json!({
                    "delivery_ids": delivery_ids,
                    "lease_id": lease_id,
                }))
        }
        Command::Nack {
            delivery_ids,
            lease_id,
            reason,
        } => {
            log(format!("Nacking {} message(s)...", delivery_ids.len()));
            let mut payload = serde_json::json!({
                "delivery_ids": delivery_ids,
                "lease_id": lease_id,
            });
            if let Some(reason) = reason {
                payload["reason"] = serde_json::json!(reason);
            }
            client
                .post(format!("{}/v1/messages/nack", settings.base_url))
                .json(&payload)
        }
    };

    let mut request = request.header("Authorization", format!("Bearer {}", settings.api_key));
    if let Some(request_id) = &cli.request_id {
        request = request.header("X-Request-Id", request_id);
    }

    let response = match request.send() {
        Ok(response) => response,
        Err(e) => {
            eprintln!("Request error: {e}");
            return EXIT_NETWORK;
        }
    };

    let status = response.status();
    let body: serde_json::Value = match response.json() {
        Ok(body) => body,
        Err(e) => {
            if status.is_success() {
                eprintln!("Failed to decode response: {e}");
                return EXIT_SERVER;
            }
            serde_json::Value::Null
        }
    };

    if !status.is_success() {
        let detail = body
            .get("detail")
            .and_then(|d| d.as_str())
            .map(String::from)
            .unwrap_or_else(|| body.to_string());
        eprintln!("Request failed ({}): {detail}", status.as_u16());
        return match status.as_u16() {
            401 | 403 => EXIT_AUTH,
            500..=599 => EXIT_SERVER,
            _ => EXIT_USAGE,
        };
    }

    let output = match &cli.command {
        // Print the messages array itself, not the envelope.
        Command::Retrieve { .. } => body.get("messages").cloned().unwrap_or(body),
        _ => body,
    };
    let dump = if cli.pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    };
    match dump {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Failed to encode output: {e}");
            return EXIT_SERVER;
        }
    }
    EXIT_SUCCESS
}
