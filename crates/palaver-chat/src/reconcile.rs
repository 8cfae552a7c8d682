//! Conversions between persisted rows, the live transcript and model context.
//!
//! Tool results are stored as separate `tool` rows and folded back into the
//! assistant message that issued the call. Results without a matching call,
//! and calls that never received a result, are dropped.

use chrono::Duration;
use palaver_llm::{Content, Message as LlmMessage, ToolCall};
use palaver_persist::{StoredMessage, StoredMessageStatus, StoredRole, StoredToolCall};
use serde_json::Value;

use crate::message::{Message, MessageStatus, Role, ToolInvocation};

/// Materialize stored rows into transcript messages, merging tool results
/// into their originating assistant invocations.
pub fn merge_tool_results(stored: Vec<StoredMessage>) -> Vec<Message> {
    let mut transcript: Vec<Message> = Vec::with_capacity(stored.len());

    for row in stored {
        match row.role {
            StoredRole::Tool => {
                let Some(tool_call_id) = row.tool_call_id.as_deref() else {
                    tracing::debug!(message_id = %row.id, "Dropping tool result without call id");
                    continue;
                };
                let target = transcript
                    .iter_mut()
                    .rev()
                    .filter(|m| m.is_assistant())
                    .find_map(|m| m.invocation_mut(tool_call_id));
                match target {
                    Some(invocation) => invocation.resolve(parse_payload(&row.content)),
                    None => tracing::debug!(
                        tool_call_id,
                        thread_id = %row.thread_id,
                        "Dropping tool result with no matching call"
                    ),
                }
            }
            StoredRole::User | StoredRole::Assistant => transcript.push(from_stored(row)),
        }
    }

    transcript
}

/// Remove tool invocations that never got a result, then any assistant
/// message left with nothing in it.
pub fn drop_dangling_tool_calls(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .cloned()
        .filter_map(|mut message| {
            if !message.is_assistant() {
                return Some(message);
            }
            message.tool_invocations.retain(ToolInvocation::has_result);
            (!message.is_blank()).then_some(message)
        })
        .collect()
}

/// Provider context for the next turn. Reasoning traces are not sent back.
pub fn to_model_context(system_prompt: Option<&str>, messages: &[Message]) -> Vec<LlmMessage> {
    let mut context = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
        context.push(LlmMessage::system(prompt));
    }

    for message in drop_dangling_tool_calls(messages) {
        match message.role {
            Role::User => context.push(LlmMessage::user(message.text_content)),
            Role::Assistant if message.tool_invocations.is_empty() => {
                if !message.text_content.is_empty() {
                    context.push(LlmMessage::assistant(message.text_content));
                }
            }
            Role::Assistant => {
                let calls = message
                    .tool_invocations
                    .iter()
                    .map(|inv| ToolCall::new(&inv.tool_call_id, &inv.tool_name, &inv.arguments))
                    .collect();
                let text = (!message.text_content.is_empty())
                    .then(|| Content::text(message.text_content.clone()));
                context.push(LlmMessage::assistant_with_tool_calls(text, calls));

                for inv in &message.tool_invocations {
                    let payload = inv.result.as_ref().map(payload_text).unwrap_or_default();
                    context.push(LlmMessage::tool(inv.tool_call_id.clone(), payload));
                }
            }
            Role::Tool => {}
        }
    }

    context
}

/// Row for the message itself
pub fn to_stored(thread_id: &str, message: &Message) -> StoredMessage {
    StoredMessage {
        id: message.id.clone(),
        thread_id: thread_id.to_string(),
        role: match message.role {
            Role::User => StoredRole::User,
            Role::Assistant => StoredRole::Assistant,
            Role::Tool => StoredRole::Tool,
        },
        content: message.text_content.clone(),
        reasoning: message.reasoning.clone().filter(|r| !r.is_empty()),
        tool_calls: message
            .tool_invocations
            .iter()
            .map(|inv| StoredToolCall::new(&inv.tool_call_id, &inv.tool_name, inv.arguments.clone()))
            .collect(),
        tool_call_id: None,
        status: match message.status {
            MessageStatus::Done | MessageStatus::Pending => StoredMessageStatus::Done,
            MessageStatus::Incomplete => StoredMessageStatus::Incomplete,
            MessageStatus::Error => StoredMessageStatus::Error,
        },
        created_at: message.created_at,
    }
}

/// Message row followed by one `tool` row per resolved invocation. Tool row
/// ids derive from the message id so repeated saves stay idempotent.
pub fn to_stored_rows(thread_id: &str, message: &Message) -> Vec<StoredMessage> {
    let mut rows = vec![to_stored(thread_id, message)];
    let resolved = message.tool_invocations.iter().filter(|inv| inv.has_result());
    for (i, inv) in resolved.enumerate() {
        let payload = inv.result.as_ref().map(payload_text).unwrap_or_default();
        let mut row = StoredMessage::tool(thread_id, &inv.tool_call_id, payload);
        row.id = format!("{}:{}", message.id, inv.tool_call_id);
        // Strictly after the assistant row, even at millisecond precision
        row.created_at = message.created_at + Duration::milliseconds(i as i64 + 1);
        rows.push(row);
    }
    rows
}

fn from_stored(row: StoredMessage) -> Message {
    let role = match row.role {
        StoredRole::User => Role::User,
        StoredRole::Assistant => Role::Assistant,
        StoredRole::Tool => Role::Tool,
    };
    Message {
        id: row.id,
        role,
        text_content: row.content,
        reasoning: row.reasoning,
        tool_invocations: row
            .tool_calls
            .into_iter()
            .map(|call| ToolInvocation::call(call.id, call.name, call.arguments))
            .collect(),
        status: match row.status {
            StoredMessageStatus::Done => MessageStatus::Done,
            StoredMessageStatus::Incomplete => MessageStatus::Incomplete,
            StoredMessageStatus::Error => MessageStatus::Error,
        },
        created_at: row.created_at,
    }
}

/// Tool payloads are usually JSON; anything else is kept as a string
pub(crate) fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn payload_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
