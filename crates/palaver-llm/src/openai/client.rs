// OpenAI-compatible chat completions client

use crate::buffer_utils::parse_sse_stream;
use crate::streaming::ChatChunkParser;
use crate::traits::{ChatClient, ChatOptions, ChatRequest, EventStream};
use crate::types::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Model families that take `max_completion_tokens` and reject `temperature`
const REASONING_MODEL_PREFIXES: [&str; 4] = ["o1", "o3", "o4", "gpt-5"];

/// HTTP client for any provider speaking the OpenAI chat completions protocol
pub struct OpenAIClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

/// Body of `POST /chat/completions` with `stream: true`
#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
}

impl<'a> CompletionPayload<'a> {
    fn new(model: &'a str, messages: &'a [Message], options: &'a ChatOptions) -> Self {
        let reasoning = is_reasoning_model(model);
        Self {
            model,
            messages,
            stream: true,
            temperature: options.temperature.filter(|_| !reasoning),
            max_tokens: options.max_tokens.filter(|_| !reasoning),
            max_completion_tokens: options.max_tokens.filter(|_| reasoning),
            reasoning_effort: options.reasoning_effort.as_deref().filter(|_| reasoning),
        }
    }
}

fn is_reasoning_model(model: &str) -> bool {
    // OpenRouter ids carry a vendor prefix, e.g. `openai/o3-mini`
    let name = model.rsplit('/').next().unwrap_or(model);
    REASONING_MODEL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

impl OpenAIClient {
    /// Client with a default API key, used when a request carries none
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let api_key = (!api_key.trim().is_empty()).then_some(api_key);
        Self::with_base_url(OPENAI_API_BASE, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve_key<'a>(&'a self, request: &'a ChatRequest) -> Result<&'a str> {
        request
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .or(self.api_key.as_deref())
            .context("No API key configured for provider")
    }
}

#[async_trait]
impl ChatClient for OpenAIClient {
    async fn chat_stream(&self, request: ChatRequest) -> Result<EventStream> {
        let api_key = self.resolve_key(&request)?;
        let payload = CompletionPayload::new(&request.model, &request.messages, &request.options);

        tracing::debug!(model = %request.model, messages = request.messages.len(), "Opening chat stream");

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Provider API error ({}): {}", status, error_text);
        }

        Ok(parse_sse_stream(response.bytes_stream(), ChatChunkParser))
    }
}
