use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub storage: StorageConfig,
    pub agent: AgentConfig,
    pub loader: LoaderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    OpenAi,
    Ollama,
}

impl ProviderType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Ollama => "llama3.2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub provider_type: ProviderType,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Environment variable holding the API key. Ollama runs without one.
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub extra_headers: Vec<(String, String)>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            provider_type: ProviderType::OpenAi,
            model: None,
            base_url: None,
            api_key_env: Some("OPENAI_API_KEY".to_owned()),
            timeout_ms: 60_000,
            max_retries: 2,
            extra_headers: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn effective_model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider_type.default_model().to_owned())
    }

    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider_type.default_base_url().to_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub pool_size: usize,
    pub seed_example_data: bool,
    pub sqlite: SqliteStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://customer_database.db".to_owned(),
            pool_size: 5,
            seed_example_data: true,
            sqlite: SqliteStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
    pub foreign_keys: bool,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            journal_mode: "WAL".to_owned(),
            foreign_keys: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub temperature: f32,
    pub max_tokens: usize,
    /// Model calls allowed per turn once tools stop being return-direct.
    pub max_tool_rounds: usize,
    pub extraction_temperature: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1_024,
            max_tool_rounds: 4,
            extraction_temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub max_source_bytes: usize,
    pub max_steps: u64,
    pub timeout_ms: u64,
    pub max_call_depth: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            max_steps: 200_000,
            timeout_ms: 10_000,
            max_call_depth: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}
