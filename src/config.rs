use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;

/// Raised when the YAML config fails to load or validate. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
    #[error("{0}")]
    Message(String),
}

pub const SCOPE_DM_USER: &str = "dm_user";
pub const SCOPE_CHANNEL: &str = "channel";
pub const SCOPE_GUILD: &str = "guild";
pub const SCOPE_DEFAULT: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub base_url: Option<String>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8080,
            base_url: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///./relay.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordBotConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Parsed for config compatibility; the ingest path does not consult it.
    #[serde(default)]
    pub allow_all_channels: bool,
    #[serde(default, deserialize_with = "stringy_vec")]
    pub channel_allowlist: Vec<String>,
}

impl DiscordBotConfig {
    pub fn resolved_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.token
            && !token.is_empty()
        {
            return Ok(token.clone());
        }
        if let Some(var) = &self.token_env
            && let Ok(value) = env::var(var)
            && !value.is_empty()
        {
            return Ok(value);
        }
        Err(ConfigError::Message(format!(
            "Discord bot '{}' is missing a token. Provide 'token' or set the referenced 'token_env'.",
            self.id
        )))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub secret_env: Option<String>,
    #[serde(default)]
    pub send_debounce_seconds: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: Vec<f64>,
}

impl WebhookConfig {
    pub fn resolved_secret(&self) -> Result<String, ConfigError> {
        if let Some(secret) = &self.secret
            && !secret.is_empty()
        {
            return Ok(secret.clone());
        }
        if let Some(var) = &self.secret_env
            && let Ok(value) = env::var(var)
            && !value.is_empty()
        {
            return Ok(value);
        }
        Err(ConfigError::Message(format!(
            "Webhook '{}' is missing a secret. Provide 'secret' or set the referenced 'secret_env'.",
            self.url
        )))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendBotConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

impl BackendBotConfig {
    pub fn resolved_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.api_key
            && !key.is_empty()
        {
            return Ok(key.clone());
        }
        if let Some(var) = &self.api_key_env
            && let Ok(value) = env::var(var)
            && !value.is_empty()
        {
            return Ok(value);
        }
        Err(ConfigError::Message(format!(
            "Backend bot '{}' is missing an API key. Provide 'api_key' or set the referenced 'api_key_env'.",
            self.id
        )))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub chat_bot_id: String,
    pub scope_type: String,
    #[serde(deserialize_with = "stringy")]
    pub scope_id: String,
    pub backend_bot_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub mode: String,
    pub precedence: Vec<String>,
    /// chat_bot_id -> backend_bot_id
    pub defaults: HashMap<String, String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: "first_match".to_string(),
            precedence: vec![
                SCOPE_DM_USER.to_string(),
                SCOPE_CHANNEL.to_string(),
                SCOPE_GUILD.to_string(),
                SCOPE_DEFAULT.to_string(),
            ],
            defaults: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub discord_bots: Vec<DiscordBotConfig>,
    #[serde(default)]
    pub backend_bots: Vec<BackendBotConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub data: AppConfig,
}

/// Load and validate the YAML config file. The path falls back to
/// `RELAY_CONFIG`, then `./config.yaml`.
pub fn load_config(path: Option<&str>) -> Result<LoadedConfig, ConfigError> {
    let candidate = PathBuf::from(
        path.map(String::from)
            .or_else(|| env::var("RELAY_CONFIG").ok())
            .unwrap_or_else(|| "config.yaml".to_string()),
    );
    if !candidate.exists() {
        return Err(ConfigError::NotFound(candidate));
    }
    let raw = std::fs::read_to_string(&candidate)?;
    let data = parse_config(&raw)?;
    Ok(LoadedConfig {
        path: candidate,
        data,
    })
}

/// Parse and validate a YAML document. Every validation failure is collected
/// into one aggregated error so operators can fix the file in a single pass.
pub fn parse_config(raw: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(raw)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    let mut discord_ids = HashSet::new();
    for bot in &config.discord_bots {
        if !discord_ids.insert(bot.id.as_str()) {
            errors.push(format!("Duplicate discord bot id: '{}'", bot.id));
        }
        if bot.enabled
            && let Err(e) = bot.resolved_token()
        {
            errors.push(e.to_string());
        }
    }

    let mut backend_ids = HashSet::new();
    let mut api_keys: HashMap<String, &str> = HashMap::new();
    for bot in &config.backend_bots {
        if !backend_ids.insert(bot.id.as_str()) {
            errors.push(format!("Duplicate backend bot id: '{}'", bot.id));
        }
        if !bot.enabled {
            continue;
        }
        match bot.resolved_api_key() {
            Ok(key) => {
                if let Some(other) = api_keys.insert(key, bot.id.as_str()) {
                    errors.push(format!(
                        "Backend bots '{}' and '{}' resolve to the same API key",
                        other, bot.id
                    ));
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
        if let Some(webhook) = &bot.webhook {
            validate_webhook(&bot.id, webhook, &mut errors);
        }
    }

    if config.routing.mode != "first_match" {
        errors.push(format!(
            "routing.mode must be 'first_match', got '{}'",
            config.routing.mode
        ));
    }
    let allowed_scopes = [SCOPE_DM_USER, SCOPE_CHANNEL, SCOPE_GUILD, SCOPE_DEFAULT];
    let mut seen_scopes = HashSet::new();
    for scope in &config.routing.precedence {
        if !allowed_scopes.contains(&scope.as_str()) {
            errors.push(format!("Unknown routing precedence entry: '{scope}'"));
        }
        if !seen_scopes.insert(scope.as_str()) {
            errors.push(format!("Routing precedence contains duplicate: '{scope}'"));
        }
    }

    for route in &config.routes {
        if ![SCOPE_DM_USER, SCOPE_CHANNEL, SCOPE_GUILD].contains(&route.scope_type.as_str()) {
            errors.push(format!(
                "Route scope_type must be one of dm_user/channel/guild, got '{}'",
                route.scope_type
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors))
    }
}

fn validate_webhook(backend_id: &str, webhook: &WebhookConfig, errors: &mut Vec<String>) {
    if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
        errors.push(format!(
            "Webhook url for backend '{backend_id}' must be http or https: '{}'",
            webhook.url
        ));
    }
    if let Err(e) = webhook.resolved_secret() {
        errors.push(format!("Backend '{backend_id}': {e}"));
    }
    if webhook.send_debounce_seconds < 0.0 {
        errors.push(format!(
            "Backend '{backend_id}': send_debounce_seconds must be >= 0"
        ));
    }
    if webhook.request_timeout_seconds <= 0.0 {
        errors.push(format!(
            "Backend '{backend_id}': request_timeout_seconds must be > 0"
        ));
    }
    if webhook.max_retries < 0 {
        errors.push(format!("Backend '{backend_id}': max_retries must be >= 0"));
    }
    if webhook.retry_backoff_seconds.is_empty() {
        errors.push(format!(
            "Backend '{backend_id}': retry_backoff_seconds must not be empty"
        ));
    } else if webhook.retry_backoff_seconds.iter().any(|s| *s <= 0.0) {
        errors.push(format!(
            "Backend '{backend_id}': retry_backoff_seconds entries must be > 0"
        ));
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> f64 {
    10.0
}

fn default_max_retries() -> i64 {
    5
}

fn default_retry_backoff() -> Vec<f64> {
    vec![2.0, 10.0, 60.0]
}

// Scope IDs and channel allowlists hold Discord snowflakes, which YAML
// authors tend to write as bare integers. Accept both forms as strings.

fn stringy<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

fn stringy_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }
    let values: Vec<StringOrNumber> = Vec::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .map(|v| match v {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        })
        .collect())
}
