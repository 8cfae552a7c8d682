//! Turn submission over Server-Sent Events.
//!
//! Each request builds a [`ChatSession`] for the thread, hydrates it from the
//! store, claims the thread in the [`SessionRegistry`](crate::registry::SessionRegistry)
//! and forwards the session's events until the turn ends.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use palaver_chat::{ChatSession, Identity, SessionConfig, SessionEvent};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use utoipa::ToSchema;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Header carrying the caller's own provider key
pub const PROVIDER_KEY_HEADER: &str = "x-provider-api-key";

const PERSIST_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub user_id: Option<String>,
    pub guest_id: Option<String>,
    pub content: String,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResendRequest {
    pub user_id: Option<String>,
    pub guest_id: Option<String>,
    pub message_id: String,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EditRequest {
    pub user_id: Option<String>,
    pub guest_id: Option<String>,
    pub message_id: String,
    pub content: String,
    pub model: Option<String>,
}

enum TurnAction {
    Submit(String),
    Resend(String),
    Edit { message_id: String, content: String },
}

/// Exactly one of `user_id` / `guest_id`, non-empty
fn resolve_identity(user_id: Option<String>, guest_id: Option<String>) -> ApiResult<Identity> {
    let user_id = user_id.filter(|id| !id.trim().is_empty());
    let guest_id = guest_id.filter(|id| !id.trim().is_empty());
    match (user_id, guest_id) {
        (Some(user), None) => Ok(Identity::User(user)),
        (None, Some(guest)) => Ok(Identity::Guest(guest)),
        (Some(_), Some(_)) => Err(ApiError::BadRequest(
            "send either user_id or guest_id, not both".to_string(),
        )),
        (None, None) => Err(ApiError::BadRequest(
            "user_id or guest_id is required".to_string(),
        )),
    }
}

fn provider_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(PROVIDER_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

/// Send a message and stream the response using Server-Sent Events
#[utoipa::path(
    post,
    path = "/threads/{thread_id}/messages",
    params(("thread_id" = String, Path, description = "Thread ID; created on first message")),
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "Streaming response", content_type = "text/event-stream"),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "A response is already streaming"),
        (status = 429, description = "Guest quota exceeded")
    ),
    tag = "messages"
)]
pub async fn send_message_stream(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let identity = resolve_identity(req.user_id, req.guest_id)?;
    run_turn(
        state,
        thread_id,
        identity,
        req.model,
        provider_key(&headers),
        TurnAction::Submit(req.content),
    )
    .await
}

/// Resend an earlier user message as a new turn
#[utoipa::path(
    post,
    path = "/threads/{thread_id}/resend",
    params(("thread_id" = String, Path, description = "Thread ID")),
    request_body = ResendRequest,
    responses(
        (status = 200, description = "Streaming response", content_type = "text/event-stream"),
        (status = 404, description = "Thread or message not found"),
        (status = 409, description = "A response is already streaming")
    ),
    tag = "messages"
)]
pub async fn resend_message_stream(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ResendRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let identity = resolve_identity(req.user_id, req.guest_id)?;
    run_turn(
        state,
        thread_id,
        identity,
        req.model,
        provider_key(&headers),
        TurnAction::Resend(req.message_id),
    )
    .await
}

/// Submit edited content for an earlier user message as a new turn
#[utoipa::path(
    post,
    path = "/threads/{thread_id}/edit",
    params(("thread_id" = String, Path, description = "Thread ID")),
    request_body = EditRequest,
    responses(
        (status = 200, description = "Streaming response", content_type = "text/event-stream"),
        (status = 404, description = "Thread or message not found"),
        (status = 409, description = "A response is already streaming")
    ),
    tag = "messages"
)]
pub async fn edit_message_stream(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<EditRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let identity = resolve_identity(req.user_id, req.guest_id)?;
    run_turn(
        state,
        thread_id,
        identity,
        req.model,
        provider_key(&headers),
        TurnAction::Edit {
            message_id: req.message_id,
            content: req.content,
        },
    )
    .await
}

/// Stop the thread's streaming response; a no-op when nothing streams
#[utoipa::path(
    post,
    path = "/threads/{thread_id}/stop",
    params(("thread_id" = String, Path, description = "Thread ID")),
    responses((status = 204, description = "Stopped, or nothing was streaming")),
    tag = "messages"
)]
pub async fn stop_stream(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> StatusCode {
    if state.sessions.stop(&thread_id).await {
        tracing::info!(%thread_id, "Stopped by request");
    }
    StatusCode::NO_CONTENT
}

async fn run_turn(
    state: Arc<AppState>,
    thread_id: String,
    identity: Identity,
    model: Option<String>,
    api_key: Option<String>,
    action: TurnAction,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let model = state
        .config
        .llm
        .resolve_model(model.as_deref())
        .ok_or_else(|| ApiError::BadRequest("model is not available".to_string()))?;

    if let Some(thread) = state.store.get_thread(&thread_id).await? {
        if thread.user_id != identity.id() {
            return Err(ApiError::Forbidden(thread_id));
        }
    }

    let mut config = SessionConfig::new(model)
        .with_options(state.config.llm.chat_options())
        .with_render_throttle_ms(state.config.session.render_throttle_ms);
    if let Some(prompt) = &state.config.llm.system_prompt {
        config = config.with_system_prompt(prompt.clone());
    }
    if let Some(key) = api_key {
        config = config.with_api_key(key);
    }

    let session = ChatSession::builder()
        .thread_id(thread_id.clone())
        .identity(identity)
        .client(Arc::clone(&state.llm_client))
        .store(Arc::clone(&state.store))
        .quota(Arc::clone(&state.quota))
        .config(config)
        .build()?;

    let session = state
        .sessions
        .claim(session)
        .ok_or(ApiError::AlreadyStreaming)?;
    let lease = Lease {
        state: Arc::clone(&state),
        session: Arc::clone(&session),
    };

    session.hydrate().await?;
    let events = session.subscribe();
    match action {
        TurnAction::Submit(content) => session.submit(&content).await?,
        TurnAction::Resend(message_id) => session.resend(&message_id).await?,
        TurnAction::Edit {
            message_id,
            content,
        } => session.edit_and_resubmit(&message_id, &content).await?,
    };

    Ok(Sse::new(forward_events(events, lease)).keep_alive(KeepAlive::default()))
}

/// Holds the thread's registry slot for the lifetime of the response.
///
/// Dropping it early (client went away) stops the turn so the partial reply
/// is persisted.
struct Lease {
    state: Arc<AppState>,
    session: Arc<ChatSession>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let thread_id = self.session.thread_id().to_string();
        if !self.session.status().is_busy() {
            self.state.sessions.release(&thread_id);
            return;
        }
        tracing::info!(%thread_id, "Client disconnected mid-stream");
        let state = Arc::clone(&self.state);
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            session.stop().await;
            state.sessions.release(&thread_id);
        });
    }
}

fn forward_events(
    mut events: broadcast::Receiver<SessionEvent>,
    lease: Lease,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _lease = lease;
        loop {
            match events.recv().await {
                Ok(event) => {
                    let ends_turn = event.ends_turn();
                    yield Ok(to_sse(&event));
                    if ends_turn {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "SSE client lagged behind session events");
                }
                Err(RecvError::Closed) => return,
            }
        }
        // The turn is persisted after it ends; hold the thread until then
        let invalidated = tokio::time::timeout(PERSIST_GRACE, async {
            loop {
                match events.recv().await {
                    Ok(event @ SessionEvent::Invalidated { .. }) => return Some(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten();
        if let Some(event) = invalidated {
            yield Ok(to_sse(&event));
        }
    }
}

fn to_sse(event: &SessionEvent) -> Event {
    let name = match event {
        SessionEvent::ThreadCreated { .. } => "thread",
        SessionEvent::Token { .. } => "message",
        SessionEvent::Reasoning { .. } => "reasoning",
        SessionEvent::ToolCall { .. } => "tool_call",
        SessionEvent::ToolResult { .. } => "tool_result",
        SessionEvent::Finished { .. } => "done",
        SessionEvent::Stopped => "stopped",
        SessionEvent::Failed { .. } => "error",
        SessionEvent::Invalidated { .. } => "invalidated",
    };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name))
}
