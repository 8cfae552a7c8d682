use config::{Config as ConfigLoader, ConfigError, Environment, File};
use palaver_llm::{ChatOptions, ProviderConfig, ProviderType};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub llm: LlmConfig,
    pub quota: QuotaConfig,
    #[serde(default)]
    pub session: SessionSettings,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,

    // Secrets (from ENV only)
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub mongodb_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single request, streaming included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderType,
    #[serde(default)]
    pub base_url: Option<String>,
    pub default_model: String,
    /// Models a request may select; empty allows any
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sent only to reasoning models
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

impl LlmConfig {
    /// Requested model, or the default, checked against the catalog
    pub fn resolve_model(&self, requested: Option<&str>) -> Option<String> {
        let model = requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);
        if self.models.is_empty() || self.models.iter().any(|m| m == model) {
            Some(model.to_string())
        } else {
            None
        }
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            reasoning_effort: self.reasoning_effort.clone(),
        }
    }

    pub fn provider_config(&self, api_key: Option<String>) -> ProviderConfig {
        ProviderConfig {
            provider: self.provider,
            api_key,
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub guest_daily_limit: u32,
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,
}

fn default_sweep_probability() -> f64 {
    palaver_chat::DEFAULT_SWEEP_PROBABILITY
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub render_throttle_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            render_throttle_ms: palaver_chat::session::DEFAULT_RENDER_THROTTLE_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Mongodb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    /// Load configuration from TOML files and environment variables
    ///
    /// Hierarchy (weakest to strongest):
    /// 1. config/default.toml
    /// 2. config/{ENV}.toml (if ENV is set)
    /// 3. `PALAVER_<SECTION>__<KEY>` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("ENV").unwrap_or_else(|_| "dev".to_string());

        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                Environment::with_prefix("PALAVER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = config.try_deserialize()?;

        // Secrets from ENV (not in TOML)
        cfg.openai_api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        cfg.mongodb_uri = std::env::var("MONGODB_URI").ok().filter(|u| !u.is_empty());
        if cfg.storage.backend == StorageBackend::Mongodb && cfg.mongodb_uri.is_none() {
            return Err(ConfigError::Message(
                "MONGODB_URI environment variable is required for the mongodb backend".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Load config from a specific path (useful for testing)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }
}
