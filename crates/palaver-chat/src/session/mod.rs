//! Live chat session for one thread.
//!
//! [`ChatSession`] owns the transcript state, opens one provider stream per
//! turn and consumes it on a single reader task. Snapshots are published on a
//! `watch` channel at the render throttle; individual events go out on a
//! `broadcast` channel as they are applied.

mod error;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use palaver_llm::{ChatClient, ChatOptions, ChatRequest, EventBatcher, EventStream, StreamEvent};
use palaver_persist::{PersistError, Thread, ThreadStore};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::message::Message;
use crate::quota::QuotaTracker;
use crate::reconcile::{merge_tool_results, parse_payload, to_model_context, to_stored_rows};

pub use error::SubmitError;
pub use state::{Applied, SessionSnapshot, SessionState, SessionStatus, TurnTicket};

pub const DEFAULT_RENDER_THROTTLE_MS: u64 = 100;
const TITLE_MAX_CHARS: usize = 80;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Who is talking; guests are subject to the daily quota
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Guest(String),
}

impl Identity {
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Guest(id) => id,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    /// Provider credential sent with each request, overriding the client default
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub options: ChatOptions,
    pub render_throttle_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            system_prompt: None,
            options: ChatOptions::default(),
            render_throttle_ms: DEFAULT_RENDER_THROTTLE_MS,
        }
    }
}

impl SessionConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_render_throttle_ms(mut self, ms: u64) -> Self {
        self.render_throttle_ms = ms;
        self
    }
}

/// Applied stream events and turn lifecycle notifications
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The thread did not exist and was created by this submit
    ThreadCreated { thread_id: String },
    Token { content: String },
    Reasoning { content: String },
    ToolCall {
        index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    ToolResult { tool_call_id: String, result: Value },
    Finished { message_id: Option<String> },
    Stopped,
    Failed { error: String },
    /// Persisted thread data changed; derived views should refetch
    Invalidated { thread_id: String },
}

impl SessionEvent {
    /// Whether no further events follow for the current turn (besides `Invalidated`)
    pub fn ends_turn(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Stopped | Self::Failed { .. })
    }

    fn from_stream(event: &StreamEvent) -> Option<Self> {
        match event {
            StreamEvent::Message { content } => Some(Self::Token {
                content: content.clone(),
            }),
            StreamEvent::Reasoning { content } => Some(Self::Reasoning {
                content: content.clone(),
            }),
            StreamEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => Some(Self::ToolCall {
                index: *index,
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            StreamEvent::ToolResult {
                tool_call_id,
                result,
                ..
            } => Some(Self::ToolResult {
                tool_call_id: tool_call_id.clone(),
                result: parse_payload(result),
            }),
            StreamEvent::Done { .. } => None,
        }
    }
}

struct Shared {
    thread_id: String,
    identity: Identity,
    client: Arc<dyn ChatClient>,
    store: Arc<dyn ThreadStore>,
    quota: Option<Arc<QuotaTracker>>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    thread_persisted: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let snapshot = self.state().snapshot();
        self.snapshot_tx.send_replace(snapshot);
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    /// Save the latest turn; failures are logged, the live transcript stays
    async fn persist_last_turn(&self) {
        let rows: Vec<_> = self
            .state()
            .last_turn()
            .iter()
            .flat_map(|m| to_stored_rows(&self.thread_id, m))
            .collect();
        if rows.is_empty() {
            return;
        }
        if let Err(e) = self.store.save_messages(rows).await {
            tracing::warn!(thread_id = %self.thread_id, error = %e, "Failed to persist turn");
            return;
        }
        if let Err(e) = self.title_thread_if_untitled().await {
            tracing::warn!(thread_id = %self.thread_id, error = %e, "Failed to set thread title");
        }
        self.emit(SessionEvent::Invalidated {
            thread_id: self.thread_id.clone(),
        });
    }

    async fn title_thread_if_untitled(&self) -> Result<(), PersistError> {
        let Some(thread) = self.store.get_thread(&self.thread_id).await? else {
            return Ok(());
        };
        if thread.title.is_some() {
            return Ok(());
        }
        let first_user = self
            .state()
            .transcript()
            .iter()
            .find(|m| m.is_user())
            .map(|m| title_from(&m.text_content));
        if let Some(title) = first_user {
            self.store.change_title(&self.thread_id, &title).await?;
        }
        Ok(())
    }

    /// Create the thread on first use so a new conversation gets a stable id
    async fn ensure_thread(&self) -> Result<(), PersistError> {
        if self.thread_persisted.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.store.get_thread(&self.thread_id).await?.is_none() {
            self.store
                .create_thread(Thread::new(&self.thread_id, self.identity.id()))
                .await?;
            tracing::info!(thread_id = %self.thread_id, "Created thread on first submit");
            self.emit(SessionEvent::ThreadCreated {
                thread_id: self.thread_id.clone(),
            });
        }
        self.thread_persisted.store(true, Ordering::Release);
        Ok(())
    }

    async fn fail_turn(&self, ticket: TurnTicket, error: String) {
        if !self.state().fail(ticket, error.clone()) {
            return;
        }
        tracing::warn!(thread_id = %self.thread_id, %error, "Chat stream failed");
        self.publish();
        self.emit(SessionEvent::Failed { error });
        self.persist_last_turn().await;
    }
}

struct Reader {
    ticket: TurnTicket,
    cancel_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reader {
    fn cancel(self) {
        let _ = self.cancel_tx.send(());
        self.handle.abort();
    }
}

/// One thread's live exchange with the model
pub struct ChatSession {
    shared: Arc<Shared>,
    reader: Mutex<Option<Reader>>,
}

impl ChatSession {
    pub fn builder() -> ChatSessionBuilder {
        ChatSessionBuilder::new()
    }

    pub fn thread_id(&self) -> &str {
        &self.shared.thread_id
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.state().status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state().snapshot()
    }

    /// Throttled snapshots
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Every applied event, unthrottled
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn set_pending_input(&self, text: impl Into<String>) {
        self.shared.state().set_pending_input(text);
        self.shared.publish();
    }

    pub fn dismiss_error(&self) {
        self.shared.state().dismiss_error();
        self.shared.publish();
    }

    /// Load the stored transcript, replacing the in-memory one
    pub async fn hydrate(&self) -> Result<(), SubmitError> {
        let stored = match self.shared.store.get_messages(&self.shared.thread_id).await {
            Ok(stored) => {
                self.shared.thread_persisted.store(true, Ordering::Release);
                stored
            }
            Err(PersistError::ThreadNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let messages = merge_tool_results(stored);
        tracing::debug!(thread_id = %self.shared.thread_id, count = messages.len(), "Hydrated session");
        self.shared.state().hydrate(messages)?;
        self.shared.publish();
        Ok(())
    }

    /// Replace-on-refetch from the store; only while idle
    pub async fn refetch(&self) -> Result<(), SubmitError> {
        self.hydrate().await
    }

    /// Send `input` as a new turn and start streaming the reply.
    ///
    /// Empty input, a turn already in flight and an exhausted guest quota are
    /// rejected before anything reaches the store or the provider. Returns
    /// once the stream is open; the reply arrives on the reader task.
    pub async fn submit(&self, input: &str) -> Result<TurnTicket, SubmitError> {
        let shared = &self.shared;
        let ticket = {
            let mut state = shared.state();
            state.check_submit(input)?;
            if let (Identity::Guest(guest_id), Some(quota)) = (&shared.identity, &shared.quota) {
                let outcome = quota.increment(guest_id);
                if !outcome.success {
                    let usage = quota.usage(guest_id);
                    return Err(SubmitError::QuotaExceeded {
                        limit: outcome.limit,
                        reset_at: usage.reset_at,
                    });
                }
            }
            state.begin_submit(input)?
        };
        shared.publish();

        if let Err(e) = shared.ensure_thread().await {
            shared.fail_turn(ticket, e.to_string()).await;
            return Err(e.into());
        }
        // Stopped while the thread was being created; save the turn now that it exists
        if shared.state().current_turn() != ticket.turn() {
            shared.persist_last_turn().await;
            return Ok(ticket);
        }

        let context = {
            let state = shared.state();
            to_model_context(shared.config.system_prompt.as_deref(), state.transcript())
        };
        let mut request = ChatRequest::new(shared.config.model.clone(), context)
            .with_options(shared.config.options.clone());
        if let Some(api_key) = &shared.config.api_key {
            request = request.with_api_key(api_key.clone());
        }

        tracing::info!(
            thread_id = %shared.thread_id,
            model = %shared.config.model,
            turn = ticket.turn(),
            "Opening chat stream"
        );
        let stream = match shared.client.chat_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = format!("{e:#}");
                shared.fail_turn(ticket, error.clone()).await;
                return Err(SubmitError::Provider(error));
            }
        };

        // Held through registration so a concurrent stop sees the new reader
        let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        // Stopped while the request was opening
        if shared.state().current_turn() != ticket.turn() {
            return Ok(ticket);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(read_stream(Arc::clone(shared), ticket, stream, cancel_rx));
        // A previous reader has already finished its turn; let it complete
        let _previous = slot.replace(Reader {
            ticket,
            cancel_tx,
            handle,
        });

        Ok(ticket)
    }

    /// Resubmit the content of an earlier user message as a new turn
    pub async fn resend(&self, message_id: &str) -> Result<TurnTicket, SubmitError> {
        let input = self.shared.state().resend_input(message_id)?;
        self.submit(&input).await
    }

    /// Submit edited content for an earlier user message as a new turn
    pub async fn edit_and_resubmit(
        &self,
        message_id: &str,
        new_content: &str,
    ) -> Result<TurnTicket, SubmitError> {
        let input = self.shared.state().edit_input(message_id, new_content)?;
        self.submit(&input).await
    }

    /// Cancel the in-flight turn, keeping its partial reply as incomplete.
    ///
    /// Returns false, changing nothing, when no turn is in flight.
    pub async fn stop(&self) -> bool {
        let reader = {
            // Lock order: reader slot, then state
            let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            let mut state = self.shared.state();
            let turn = state.current_turn();
            if !state.stop() {
                return false;
            }
            // Readers of earlier turns may still be persisting
            if slot.as_ref().is_some_and(|r| r.ticket.turn() == turn) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(reader) = reader {
            reader.cancel();
        }

        tracing::info!(thread_id = %self.shared.thread_id, "Chat stream stopped");
        self.shared.publish();
        self.shared.emit(SessionEvent::Stopped);
        // Before the thread exists, submit saves the turn once it is created
        if self.shared.thread_persisted.load(Ordering::Acquire) {
            self.shared.persist_last_turn().await;
        }
        true
    }

    /// Wait for the current reader task, if any, to finish
    pub async fn join(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|reader| reader.handle);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.shared.state().transcript().to_vec()
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return;
        };
        let in_flight = {
            let mut state = self.shared.state();
            let live = state.current_turn() == reader.ticket.turn();
            live && state.stop()
        };
        if in_flight {
            tracing::debug!(thread_id = %self.shared.thread_id, "Session dropped mid-stream");
            reader.cancel();
        }
    }
}

enum StreamEnd {
    Finished,
    Failed(String),
    Cancelled,
}

async fn read_stream(
    shared: Arc<Shared>,
    ticket: TurnTicket,
    mut stream: EventStream,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut render = EventBatcher::<()>::new(Duration::from_millis(shared.config.render_throttle_ms));
    let mut cancel_open = true;

    let end = loop {
        tokio::select! {
            biased;

            signal = &mut cancel_rx, if cancel_open => match signal {
                Ok(()) => break StreamEnd::Cancelled,
                // A dropped sender is not a cancel
                Err(_) => cancel_open = false,
            },

            _ = render.next_batch() => shared.publish(),

            next = stream.next() => match next {
                Some(Ok(event)) => {
                    let wire = SessionEvent::from_stream(&event);
                    let applied = shared.state().apply(ticket, event);
                    match applied {
                        Applied::Accepted => {
                            render.push(());
                            if let Some(wire) = wire {
                                shared.emit(wire);
                            }
                        }
                        Applied::Finished => break StreamEnd::Finished,
                        Applied::Ignored => break StreamEnd::Cancelled,
                    }
                }
                Some(Err(e)) => break StreamEnd::Failed(format!("{e:#}")),
                // Closed without an explicit end marker
                None => {
                    let finished = shared.state().finish(ticket);
                    break if finished { StreamEnd::Finished } else { StreamEnd::Cancelled };
                }
            },
        }
    };
    drop(stream);

    match end {
        StreamEnd::Finished => {
            let message_id = shared
                .state()
                .last_turn()
                .last()
                .filter(|m| m.is_assistant())
                .map(|m| m.id.clone());
            shared.publish();
            tracing::info!(thread_id = %shared.thread_id, turn = ticket.turn(), "Chat stream finished");
            shared.emit(SessionEvent::Finished { message_id });
            shared.persist_last_turn().await;
        }
        StreamEnd::Failed(error) => shared.fail_turn(ticket, error).await,
        StreamEnd::Cancelled => {
            tracing::debug!(thread_id = %shared.thread_id, turn = ticket.turn(), "Reader exiting after cancel");
        }
    }
}

/// First line of the opening message, cut at a character boundary
fn title_from(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

pub struct ChatSessionBuilder {
    thread_id: Option<String>,
    identity: Option<Identity>,
    client: Option<Arc<dyn ChatClient>>,
    store: Option<Arc<dyn ThreadStore>>,
    quota: Option<Arc<QuotaTracker>>,
    config: SessionConfig,
}

impl ChatSessionBuilder {
    pub fn new() -> Self {
        Self {
            thread_id: None,
            identity: None,
            client: None,
            store: None,
            quota: None,
            config: SessionConfig::default(),
        }
    }

    /// Existing thread to continue; a fresh id is generated when unset
    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn store(mut self, store: Arc<dyn ThreadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn quota(mut self, quota: Arc<QuotaTracker>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ChatSession, PersistError> {
        let identity = self
            .identity
            .ok_or_else(|| PersistError::Internal("identity is required".to_string()))?;
        let client = self
            .client
            .ok_or_else(|| PersistError::Internal("client is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| PersistError::Internal("store is required".to_string()))?;
        let thread_id = self
            .thread_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let state = SessionState::new(thread_id.clone());
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(ChatSession {
            shared: Arc::new(Shared {
                thread_id,
                identity,
                client,
                store,
                quota: self.quota,
                config: self.config,
                state: Mutex::new(state),
                snapshot_tx,
                events_tx,
                thread_persisted: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        })
    }
}

impl Default for ChatSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
