use std::path::Path;

use crate::config::schema::{Config, ProviderType};
use crate::error::{Error, Result};

pub const ENV_PROVIDER: &str = "SQLITE_AGENT_PROVIDER";
pub const ENV_MODEL: &str = "SQLITE_AGENT_MODEL";
pub const ENV_BASE_URL: &str = "SQLITE_AGENT_BASE_URL";
pub const ENV_DATABASE_URL: &str = "SQLITE_AGENT_DATABASE_URL";
pub const ENV_LOG_LEVEL: &str = "SQLITE_AGENT_LOG_LEVEL";

/// Loads the config file when one is given, otherwise starts from defaults,
/// then applies environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => load_from_file(path)?,
        None => Config::default(),
    };

    load_from_env(config)
}

pub fn load_from_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!("failed to read config '{}': {err}", path.display()))
    })?;

    toml::from_str(&content).map_err(|err| {
        Error::Config(format!(
            "failed to parse config '{}': {err}",
            path.display()
        ))
    })
}

pub fn load_from_env(config: Config) -> Result<Config> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides<F>(mut config: Config, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    };

    if let Some(value) = read(ENV_PROVIDER) {
        let provider_type = ProviderType::parse(&value).ok_or_else(|| {
            Error::Config(format!(
                "{ENV_PROVIDER} has unsupported value '{value}' (expected openai|ollama)"
            ))
        })?;
        if provider_type != config.provider.provider_type {
            config.provider.provider_type = provider_type;
            if provider_type == ProviderType::Ollama {
                config.provider.api_key_env = None;
            }
        }
    }

    if let Some(value) = read(ENV_MODEL) {
        config.provider.model = Some(value);
    }
    if let Some(value) = read(ENV_BASE_URL) {
        config.provider.base_url = Some(value);
    }
    if let Some(value) = read(ENV_DATABASE_URL) {
        config.storage.database_url = value;
    }
    if let Some(value) = read(ENV_LOG_LEVEL) {
        config.logging.level = value;
    }

    Ok(config)
}
