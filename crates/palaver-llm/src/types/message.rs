use serde::{Deserialize, Serialize};

use super::content::Content;
use super::tool::ToolCall;

/// One entry of the model context, in chat completions wire shape.
///
/// Serializes directly into the `messages` array of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System { content: Content },
    User { content: Content },
    /// `content` is sent as an explicit null when the turn only called tools
    Assistant {
        content: Option<Content>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool { tool_call_id: String, content: Content },
}

impl Message {
    pub fn system(content: impl Into<Content>) -> Self {
        Self::System { content: content.into() }
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::User { content: content.into() }
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tool_calls(content: Option<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant { content, tool_calls }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Flattened text, if the message carries any
    pub fn text(&self) -> Option<String> {
        match self {
            Self::System { content } | Self::User { content } | Self::Tool { content, .. } => {
                Some(content.to_text())
            }
            Self::Assistant { content, .. } => content.as_ref().map(Content::to_text),
        }
    }
}
