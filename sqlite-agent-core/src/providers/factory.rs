use std::sync::Arc;

use crate::config::schema::{ProviderConfig, ProviderType};
use crate::error::{Error, Result};
use crate::providers::http::{build_client, RetryPolicy};
use crate::providers::ollama::OllamaProvider;
use crate::providers::openai::OpenAiProvider;
use crate::providers::types::ModelProvider;

pub fn create_provider(provider: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    match provider.provider_type {
        ProviderType::OpenAi => build_openai_provider(provider),
        ProviderType::Ollama => build_ollama_provider(provider),
    }
}

fn resolve_api_key(provider: &ProviderConfig) -> Result<Option<String>> {
    let Some(api_key_env) = provider
        .api_key_env
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };

    std::env::var(api_key_env).map(Some).map_err(|_| {
        Error::Provider(format!(
            "provider '{}' requires env var '{}' to be set",
            provider.name, api_key_env
        ))
    })
}

fn build_openai_provider(provider: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    let api_key = resolve_api_key(provider)?.ok_or_else(|| {
        Error::Provider(format!(
            "provider '{}' is missing required 'api_key_env'",
            provider.name
        ))
    })?;
    let client = build_client(provider, Some(&api_key), "OpenAI")?;

    tracing::debug!(
        provider = %provider.name,
        model = %provider.effective_model(),
        "creating OpenAI provider"
    );
    Ok(Arc::new(OpenAiProvider::new(
        provider.name.clone(),
        provider.effective_model(),
        &provider.effective_base_url(),
        client,
        RetryPolicy::from_config(provider),
    )))
}

fn build_ollama_provider(provider: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    let api_key = resolve_api_key(provider)?;
    let client = build_client(provider, api_key.as_deref(), "Ollama")?;

    tracing::debug!(
        provider = %provider.name,
        model = %provider.effective_model(),
        "creating Ollama provider"
    );
    Ok(Arc::new(OllamaProvider::new(
        provider.name.clone(),
        provider.effective_model(),
        &provider.effective_base_url(),
        client,
        RetryPolicy::from_config(provider),
    )))
}
