//! Streaming client for OpenAI-compatible chat completion providers.

pub mod buffer_utils;
pub mod config;
pub mod openai;
pub mod streaming;
pub mod traits;
pub mod types;

pub use buffer_utils::{EventBatcher, LineBuffer};
pub use config::{ClientFactory, ProviderConfig, ProviderType};
pub use openai::OpenAIClient;
pub use streaming::StreamEvent;
pub use traits::{ChatClient, ChatOptions, ChatRequest, EventStream};
pub use types::{Content, ContentPart, FunctionCall, Message, ToolCall};
