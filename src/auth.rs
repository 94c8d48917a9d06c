use crate::config::{AppConfig, ConfigError};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendIdentity {
    pub id: String,
    pub name: String,
}

/// Resolves backend bots from bearer API keys. Built once at startup from
/// enabled backends; plain map lookup at request time.
pub struct AuthService {
    keys: HashMap<String, BackendIdentity>,
}

impl AuthService {
    pub fn new(config: &AppConfig) -> Result<Self, ConfigError> {
        let mut keys = HashMap::new();
        for bot in &config.backend_bots {
            if !bot.enabled {
                continue;
            }
            let api_key = bot.resolved_api_key()?;
            if keys
                .insert(
                    api_key,
                    BackendIdentity {
                        id: bot.id.clone(),
                        name: bot.name.clone(),
                    },
                )
                .is_some()
            {
                return Err(ConfigError::Message(
                    "Duplicate backend API key detected. Keys must be unique.".to_string(),
                ));
            }
        }
        Ok(AuthService { keys })
    }

    pub fn authenticate(&self, api_key: &str) -> Option<&BackendIdentity> {
        self.keys.get(api_key)
    }
}
