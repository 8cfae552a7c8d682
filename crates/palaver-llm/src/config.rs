// Provider configuration and client factory

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::openai::{OpenAIClient, OPENAI_API_BASE, OPENROUTER_API_BASE};
use crate::traits::ChatClient;

/// Supported providers; all speak the OpenAI chat completions protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    OpenAI,
    OpenRouter,
}

impl ProviderType {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => OPENAI_API_BASE,
            ProviderType::OpenRouter => OPENROUTER_API_BASE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider: ProviderType,

    /// Server-side default key; requests may bring their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Overrides the provider's public endpoint (proxies, local gateways)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            provider: ProviderType::OpenAI,
            api_key: Some(api_key.into()),
            base_url: None,
        }
    }

    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self {
            provider: ProviderType::OpenRouter,
            api_key: Some(api_key.into()),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider
    }

    pub fn resolved_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

/// Creates chat clients from configuration
pub struct ClientFactory;

impl ClientFactory {
    pub fn create_client(config: ProviderConfig) -> Result<Arc<dyn ChatClient>> {
        let api_key = config.api_key.clone().filter(|key| !key.trim().is_empty());
        let client = OpenAIClient::with_base_url(config.resolved_base_url(), api_key)?;
        tracing::info!(provider = ?config.provider, base_url = %client.base_url(), "Created chat client");
        Ok(Arc::new(client))
    }
}
