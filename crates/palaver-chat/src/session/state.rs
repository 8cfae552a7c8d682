//! Synchronous transcript state machine.
//!
//! `Idle -> Submitted -> Streaming -> Idle` on success, `busy -> Idle` on stop,
//! `busy -> Error -> Idle` on failure. Every accepted submit opens a new turn;
//! stream events carry the [`TurnTicket`] of the turn they belong to and are
//! ignored once that turn is no longer current.

use std::collections::HashMap;

use palaver_llm::StreamEvent;
use serde::Serialize;
use serde_json::{json, Value};

use super::error::SubmitError;
use crate::message::{Message, MessageStatus, ToolInvocation};
use crate::reconcile::parse_payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Submitted,
    Streaming,
    Error,
}

impl SessionStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Submitted | Self::Streaming)
    }
}

/// Identifies the turn a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTicket {
    turn: u64,
}

impl TurnTicket {
    pub fn turn(&self) -> u64 {
        self.turn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    /// Stale turn or nothing in flight
    Ignored,
    /// The event ended the turn
    Finished,
}

/// Cloned view of the session published to observers
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub thread_id: String,
    pub transcript: Vec<Message>,
    pub status: SessionStatus,
    pub pending_input: String,
    pub error: Option<String>,
    pub turn: u64,
}

impl SessionSnapshot {
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .map(|m| m.text_content.as_str())
    }
}

#[derive(Debug, Default)]
struct ToolCallSlot {
    invocation: usize,
    arguments: String,
}

#[derive(Debug)]
pub struct SessionState {
    thread_id: String,
    transcript: Vec<Message>,
    status: SessionStatus,
    pending_input: String,
    error: Option<String>,
    turn: u64,
    /// Index of the current turn's user message
    turn_start: Option<usize>,
    /// Index of the current turn's assistant message, once opened
    assistant: Option<usize>,
    tool_slots: HashMap<u32, ToolCallSlot>,
}

impl SessionState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            transcript: Vec::new(),
            status: SessionStatus::Idle,
            pending_input: String::new(),
            error: None,
            turn: 0,
            turn_start: None,
            assistant: None,
            tool_slots: HashMap::new(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn current_turn(&self) -> u64 {
        self.turn
    }

    pub fn set_pending_input(&mut self, text: impl Into<String>) {
        self.pending_input = text.into();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            thread_id: self.thread_id.clone(),
            transcript: self.transcript.clone(),
            status: self.status,
            pending_input: self.pending_input.clone(),
            error: self.error.clone(),
            turn: self.turn,
        }
    }

    /// Validate input and open a new turn with an optimistic user message
    pub fn begin_submit(&mut self, input: &str) -> Result<TurnTicket, SubmitError> {
        self.check_submit(input)?;

        self.transcript.push(Message::user(input));
        self.turn_start = Some(self.transcript.len() - 1);
        self.assistant = None;
        self.tool_slots.clear();
        self.pending_input.clear();
        self.error = None;
        self.status = SessionStatus::Submitted;
        self.turn += 1;
        Ok(TurnTicket { turn: self.turn })
    }

    /// The local checks `begin_submit` performs, without side effects
    pub fn check_submit(&self, input: &str) -> Result<(), SubmitError> {
        if input.trim().is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        if self.status.is_busy() {
            return Err(SubmitError::AlreadyStreaming);
        }
        Ok(())
    }

    pub fn apply(&mut self, ticket: TurnTicket, event: StreamEvent) -> Applied {
        if !self.is_live(ticket) {
            return Applied::Ignored;
        }

        match event {
            StreamEvent::Message { content } => {
                self.open_assistant().text_content.push_str(&content);
            }
            StreamEvent::Reasoning { content } => {
                self.open_assistant()
                    .reasoning
                    .get_or_insert_with(String::new)
                    .push_str(&content);
            }
            StreamEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => self.apply_tool_call(index, id, name, arguments),
            StreamEvent::ToolResult {
                tool_call_id,
                result,
                is_error,
            } => {
                let payload = if is_error {
                    json!({ "error": result })
                } else {
                    parse_payload(&result)
                };
                match self.open_assistant().invocation_mut(&tool_call_id) {
                    Some(invocation) => invocation.resolve(payload),
                    None => tracing::debug!(%tool_call_id, "Tool result for unknown call ignored"),
                }
            }
            StreamEvent::Done { .. } => {
                self.finish(ticket);
                return Applied::Finished;
            }
        }
        Applied::Accepted
    }

    /// End the turn successfully; records an empty reply if nothing arrived
    pub fn finish(&mut self, ticket: TurnTicket) -> bool {
        if !self.is_live(ticket) {
            return false;
        }
        self.open_assistant().status = MessageStatus::Done;
        self.close_turn(SessionStatus::Idle);
        true
    }

    /// End the turn with a transport error; partial content is kept
    pub fn fail(&mut self, ticket: TurnTicket, error: impl Into<String>) -> bool {
        if !self.is_live(ticket) {
            return false;
        }
        if let Some(message) = self.assistant.and_then(|i| self.transcript.get_mut(i)) {
            message.status = MessageStatus::Error;
        }
        self.error = Some(error.into());
        self.close_turn(SessionStatus::Error);
        true
    }

    /// Cancel the in-flight turn. Returns false when nothing was in flight.
    pub fn stop(&mut self) -> bool {
        if !self.status.is_busy() {
            return false;
        }
        if let Some(message) = self.assistant.and_then(|i| self.transcript.get_mut(i)) {
            message.status = MessageStatus::Incomplete;
        }
        self.close_turn(SessionStatus::Idle);
        // Anything still in flight for the old ticket is now stale
        self.turn += 1;
        true
    }

    pub fn dismiss_error(&mut self) {
        if self.status == SessionStatus::Error {
            self.status = SessionStatus::Idle;
            self.error = None;
        }
    }

    /// Replace the transcript with canonical messages from the store
    pub fn hydrate(&mut self, messages: Vec<Message>) -> Result<(), SubmitError> {
        if self.status.is_busy() {
            return Err(SubmitError::AlreadyStreaming);
        }
        self.transcript = messages;
        self.turn_start = None;
        self.assistant = None;
        self.tool_slots.clear();
        Ok(())
    }

    /// Messages of the most recent turn: its user message and any reply
    pub fn last_turn(&self) -> Vec<Message> {
        match self.turn_start {
            Some(start) => self.transcript[start..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Content to resubmit for a historical user message
    pub fn resend_input(&self, message_id: &str) -> Result<String, SubmitError> {
        Ok(self.user_message(message_id)?.text_content.clone())
    }

    /// Replacement content for a historical user message; the original stays
    pub fn edit_input(&self, message_id: &str, new_content: &str) -> Result<String, SubmitError> {
        self.user_message(message_id)?;
        Ok(new_content.to_string())
    }

    fn user_message(&self, message_id: &str) -> Result<&Message, SubmitError> {
        let message = self
            .transcript
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| SubmitError::MessageNotFound(message_id.to_string()))?;
        if !message.is_user() {
            return Err(SubmitError::NotEditable(message_id.to_string()));
        }
        Ok(message)
    }

    fn is_live(&self, ticket: TurnTicket) -> bool {
        ticket.turn == self.turn && self.status.is_busy()
    }

    fn open_assistant(&mut self) -> &mut Message {
        let index = match self.assistant {
            Some(index) => index,
            None => {
                self.transcript.push(Message::pending_assistant());
                let index = self.transcript.len() - 1;
                self.assistant = Some(index);
                self.status = SessionStatus::Streaming;
                index
            }
        };
        &mut self.transcript[index]
    }

    fn apply_tool_call(
        &mut self,
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) {
        let invocation_count = self.open_assistant().tool_invocations.len();
        let slot = self.tool_slots.entry(index).or_insert_with(|| ToolCallSlot {
            invocation: invocation_count,
            arguments: String::new(),
        });
        if let Some(fragment) = arguments {
            slot.arguments.push_str(&fragment);
        }
        let slot_index = slot.invocation;
        let raw_arguments = slot.arguments.clone();

        let message = self.open_assistant();
        if slot_index == message.tool_invocations.len() {
            message
                .tool_invocations
                .push(ToolInvocation::call(String::new(), String::new(), Value::Null));
        }
        let invocation = &mut message.tool_invocations[slot_index];
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            invocation.tool_call_id = id;
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            invocation.tool_name.push_str(&name);
        }
        if !raw_arguments.is_empty() {
            invocation.arguments = parse_payload(&raw_arguments);
        }
    }

    fn close_turn(&mut self, status: SessionStatus) {
        self.status = status;
        self.assistant = None;
        self.tool_slots.clear();
    }
}
