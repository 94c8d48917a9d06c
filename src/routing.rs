use crate::config::{
    AppConfig, ConfigError, SCOPE_CHANNEL, SCOPE_DEFAULT, SCOPE_DM_USER, SCOPE_GUILD,
};
use std::collections::{HashMap, HashSet};

/// The routing context for one inbound message.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub chat_bot_id: &'a str,
    pub author_id: &'a str,
    pub channel_id: Option<&'a str>,
    pub guild_id: Option<&'a str>,
    pub is_dm: bool,
}

/// Resolves backend bots for inbound chat messages. Built once at startup;
/// immutable afterwards.
#[derive(Debug)]
pub struct RoutingTable {
    precedence: Vec<String>,
    defaults: HashMap<String, String>,
    dm_routes: HashMap<String, HashMap<String, String>>,
    channel_routes: HashMap<String, HashMap<String, String>>,
    guild_routes: HashMap<String, HashMap<String, String>>,
}

impl RoutingTable {
    pub fn new(config: &AppConfig) -> Result<Self, ConfigError> {
        let valid_chat_ids: HashSet<&str> =
            config.discord_bots.iter().map(|b| b.id.as_str()).collect();
        let valid_backend_ids: HashSet<&str> =
            config.backend_bots.iter().map(|b| b.id.as_str()).collect();

        let mut table = RoutingTable {
            precedence: config.routing.precedence.clone(),
            defaults: config.routing.defaults.clone(),
            dm_routes: HashMap::new(),
            channel_routes: HashMap::new(),
            guild_routes: HashMap::new(),
        };

        for route in &config.routes {
            if !valid_chat_ids.contains(route.chat_bot_id.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Route references unknown chat_bot_id '{}'",
                    route.chat_bot_id
                )));
            }
            if !valid_backend_ids.contains(route.backend_bot_id.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Route references unknown backend_bot_id '{}'",
                    route.backend_bot_id
                )));
            }

            let scoped = match route.scope_type.as_str() {
                SCOPE_DM_USER => &mut table.dm_routes,
                SCOPE_CHANNEL => &mut table.channel_routes,
                SCOPE_GUILD => &mut table.guild_routes,
                other => {
                    return Err(ConfigError::Message(format!(
                        "Unsupported scope type: {other}"
                    )));
                }
            };
            let entries = scoped.entry(route.chat_bot_id.clone()).or_default();
            if entries.contains_key(&route.scope_id) {
                return Err(ConfigError::Message(format!(
                    "Multiple routes defined for {} '{}' under chat bot '{}'",
                    route.scope_type, route.scope_id, route.chat_bot_id
                )));
            }
            entries.insert(route.scope_id.clone(), route.backend_bot_id.clone());
        }

        for (chat_bot_id, backend_id) in &table.defaults {
            if !valid_chat_ids.contains(chat_bot_id.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Default route references unknown chat bot '{chat_bot_id}'"
                )));
            }
            if !valid_backend_ids.contains(backend_id.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Default route references unknown backend bot '{backend_id}'"
                )));
            }
        }

        Ok(table)
    }

    /// Walk the precedence list; first successful lookup wins.
    pub fn resolve_backend(&self, ctx: &MessageContext<'_>) -> Option<String> {
        for scope in &self.precedence {
            let backend = match scope.as_str() {
                SCOPE_DM_USER if ctx.is_dm => self
                    .dm_routes
                    .get(ctx.chat_bot_id)
                    .and_then(|routes| routes.get(ctx.author_id)),
                SCOPE_CHANNEL if !ctx.is_dm => ctx.channel_id.and_then(|channel_id| {
                    self.channel_routes
                        .get(ctx.chat_bot_id)
                        .and_then(|routes| routes.get(channel_id))
                }),
                SCOPE_GUILD => ctx.guild_id.and_then(|guild_id| {
                    self.guild_routes
                        .get(ctx.chat_bot_id)
                        .and_then(|routes| routes.get(guild_id))
                }),
                SCOPE_DEFAULT => self.defaults.get(ctx.chat_bot_id),
                _ => None,
            };
            if let Some(backend) = backend {
                return Some(backend.clone());
            }
        }
        None
    }
}
