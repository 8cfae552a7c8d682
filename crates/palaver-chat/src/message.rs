use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Assistant message still receiving stream events
    Pending,
    Done,
    /// Stopped by the user before the stream ended
    Incomplete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    Call,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub state: InvocationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ToolInvocation {
    pub fn call(tool_call_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            state: InvocationState::Call,
            result: None,
        }
    }

    pub fn resolve(&mut self, result: Value) {
        self.state = InvocationState::Result;
        self.result = Some(result);
    }

    pub fn has_result(&self) -> bool {
        self.state == InvocationState::Result
    }
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, text: String, status: MessageStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text_content: text,
            reasoning: None,
            tool_invocations: Vec::new(),
            status,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into(), MessageStatus::Done)
    }

    /// Empty assistant message opened at the start of a streamed reply
    pub fn pending_assistant() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Pending)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text.into(), MessageStatus::Done)
    }

    pub fn with_invocation(mut self, invocation: ToolInvocation) -> Self {
        self.tool_invocations.push(invocation);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn invocation_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.tool_invocations
            .iter_mut()
            .find(|inv| inv.tool_call_id == tool_call_id)
    }

    /// No text, no reasoning and no tool invocations
    pub fn is_blank(&self) -> bool {
        self.text_content.is_empty()
            && self.reasoning.as_deref().map_or(true, str::is_empty)
            && self.tool_invocations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_resolve() {
        let mut inv = ToolInvocation::call("a", "search", json!({"q": "tides"}));
        assert!(!inv.has_result());
        inv.resolve(json!({"hits": 3}));
        assert_eq!(inv.state, InvocationState::Result);
        assert_eq!(inv.result, Some(json!({"hits": 3})));
    }

    #[test]
    fn test_blank_assistant() {
        let mut message = Message::pending_assistant();
        assert!(message.is_blank());
        message.reasoning = Some(String::new());
        assert!(message.is_blank());
        message.text_content.push_str("hi");
        assert!(!message.is_blank());
    }

    #[test]
    fn test_message_serialization_shape() {
        let message = Message::assistant("done")
            .with_invocation(ToolInvocation::call("a", "search", json!({})));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["status"], "done");
        assert_eq!(value["tool_invocations"][0]["state"], "call");
        assert!(value.get("reasoning").is_none());
    }
}
