use crate::config::schema::{Config, ProviderType};
use crate::error::{Error, Result};

/// Longest wall-clock budget a tool script may be given.
pub const MAX_SCRIPT_TIMEOUT_MS: u64 = 10 * 60 * 1000;

pub fn validate_config(config: &Config) -> Result<()> {
    let provider = &config.provider;
    if provider.name.trim().is_empty() {
        return Err(Error::Validation(
            "provider name cannot be empty".to_owned(),
        ));
    }

    if provider.effective_model().trim().is_empty() {
        return Err(Error::Validation(format!(
            "provider '{}' has an empty model name",
            provider.name
        )));
    }

    let base_url = provider.effective_base_url();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(Error::Validation(format!(
            "provider '{}' base_url '{base_url}' must start with http:// or https://",
            provider.name
        )));
    }

    if provider.provider_type == ProviderType::OpenAi
        && provider
            .api_key_env
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
    {
        return Err(Error::Validation(format!(
            "provider '{}' of type open_ai requires 'api_key_env'",
            provider.name
        )));
    }

    if !config.storage.database_url.starts_with("sqlite:") {
        return Err(Error::Validation(format!(
            "storage.database_url '{}' must be a sqlite: URL",
            config.storage.database_url
        )));
    }

    if config.storage.pool_size == 0 {
        return Err(Error::Validation(
            "storage.pool_size must be at least 1".to_owned(),
        ));
    }

    if config.agent.max_tool_rounds == 0 {
        return Err(Error::Validation(
            "agent.max_tool_rounds must be at least 1".to_owned(),
        ));
    }

    let loader = &config.loader;
    if loader.max_steps == 0 || loader.timeout_ms == 0 || loader.max_call_depth == 0 {
        return Err(Error::Validation(
            "loader.max_steps, loader.timeout_ms and loader.max_call_depth must be positive"
                .to_owned(),
        ));
    }

    if loader.timeout_ms > MAX_SCRIPT_TIMEOUT_MS {
        return Err(Error::Validation(format!(
            "loader.timeout_ms must be at most {MAX_SCRIPT_TIMEOUT_MS}, got {}",
            loader.timeout_ms
        )));
    }

    Ok(())
}
