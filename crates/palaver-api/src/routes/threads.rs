use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use palaver_persist::{Thread, ThreadQuery, Visibility};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_PAGE: usize = 100;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateThreadRequest {
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ThreadResponse {
    pub thread_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub pinned: bool,
    /// `private` or `public`
    pub visibility: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Thread> for ThreadResponse {
    fn from(thread: Thread) -> Self {
        Self {
            thread_id: thread.id,
            user_id: thread.user_id,
            title: thread.title,
            pinned: thread.pinned,
            visibility: visibility_name(thread.visibility).to_string(),
            project_id: thread.project_id,
            created_at: thread.created_at,
            updated_at: thread.updated_at,
        }
    }
}

fn visibility_name(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Private => "private",
        Visibility::Public => "public",
    }
}

fn parse_visibility(value: &str) -> ApiResult<Visibility> {
    match value {
        "private" => Ok(Visibility::Private),
        "public" => Ok(Visibility::Public),
        other => Err(ApiError::BadRequest(format!(
            "visibility must be 'private' or 'public', got '{other}'"
        ))),
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListThreadsQuery {
    pub user_id: String,
    pub project_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListThreadsResponse {
    pub threads: Vec<ThreadResponse>,
    pub has_more: bool,
}

/// Partial update; absent fields are left alone. `project_id: null` removes
/// the thread from its project.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateThreadRequest {
    pub title: Option<String>,
    pub pinned: Option<bool>,
    pub visibility: Option<String>,
    #[serde(default, deserialize_with = "present")]
    #[schema(value_type = Option<String>)]
    pub project_id: Option<Option<String>>,
}

/// Distinguishes an explicit `null` from a missing field
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Create a new thread
#[utoipa::path(
    post,
    path = "/threads",
    request_body = CreateThreadRequest,
    responses(
        (status = 201, description = "Thread created", body = ThreadResponse),
        (status = 400, description = "Invalid request")
    ),
    tag = "threads"
)]
pub async fn create_thread(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateThreadRequest>,
) -> ApiResult<(StatusCode, Json<ThreadResponse>)> {
    if req.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }

    let mut thread = Thread::new(uuid::Uuid::new_v4().to_string(), req.user_id);
    if let Some(title) = req.title.filter(|t| !t.trim().is_empty()) {
        thread = thread.with_title(title);
    }
    let thread = state.store.create_thread(thread).await?;
    if let Some(project_id) = req.project_id {
        state.store.set_project(&thread.id, Some(&project_id)).await?;
    }

    let created = load_thread(&state, &thread.id).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// List threads for a user, pinned first then most recently updated
#[utoipa::path(
    get,
    path = "/threads",
    params(ListThreadsQuery),
    responses(
        (status = 200, description = "List of threads", body = ListThreadsResponse),
        (status = 400, description = "Invalid request")
    ),
    tag = "threads"
)]
pub async fn list_threads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListThreadsQuery>,
) -> ApiResult<Json<ListThreadsResponse>> {
    let limit = query.limit.clamp(1, MAX_PAGE);
    let mut filter = ThreadQuery::for_user(query.user_id).limit(limit);
    if let Some(project_id) = query.project_id {
        filter = filter.project(project_id);
    }

    let threads = state.store.list_threads(filter).await?;
    let has_more = threads.len() == limit;

    Ok(Json(ListThreadsResponse {
        threads: threads.into_iter().map(ThreadResponse::from).collect(),
        has_more,
    }))
}

/// Get a specific thread by ID
#[utoipa::path(
    get,
    path = "/threads/{thread_id}",
    params(("thread_id" = String, Path, description = "Thread ID")),
    responses(
        (status = 200, description = "Thread found", body = ThreadResponse),
        (status = 404, description = "Thread not found")
    ),
    tag = "threads"
)]
pub async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<ThreadResponse>> {
    let thread = load_thread(&state, &thread_id).await?;
    Ok(Json(thread.into()))
}

/// Update title, pin flag, visibility or project
#[utoipa::path(
    patch,
    path = "/threads/{thread_id}",
    params(("thread_id" = String, Path, description = "Thread ID")),
    request_body = UpdateThreadRequest,
    responses(
        (status = 200, description = "Thread updated", body = ThreadResponse),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Thread or project not found")
    ),
    tag = "threads"
)]
pub async fn update_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Json(req): Json<UpdateThreadRequest>,
) -> ApiResult<Json<ThreadResponse>> {
    // Validate everything before the first write
    let visibility = req.visibility.as_deref().map(parse_visibility).transpose()?;
    let title = match req.title {
        Some(title) if title.trim().is_empty() => {
            return Err(ApiError::BadRequest("title cannot be empty".to_string()))
        }
        other => other,
    };
    load_thread(&state, &thread_id).await?;

    if let Some(title) = title {
        state.store.change_title(&thread_id, title.trim()).await?;
    }
    if let Some(pinned) = req.pinned {
        state.store.set_pinned(&thread_id, pinned).await?;
    }
    if let Some(visibility) = visibility {
        state.store.set_visibility(&thread_id, visibility).await?;
    }
    if let Some(project_id) = req.project_id {
        state
            .store
            .set_project(&thread_id, project_id.as_deref())
            .await?;
    }

    let thread = load_thread(&state, &thread_id).await?;
    Ok(Json(thread.into()))
}

/// Delete a thread and its messages
#[utoipa::path(
    delete,
    path = "/threads/{thread_id}",
    params(("thread_id" = String, Path, description = "Thread ID")),
    responses(
        (status = 204, description = "Thread deleted"),
        (status = 404, description = "Thread not found"),
        (status = 409, description = "A response is still streaming")
    ),
    tag = "threads"
)]
pub async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.sessions.is_live(&thread_id) {
        return Err(ApiError::AlreadyStreaming);
    }
    state.store.delete_thread(&thread_id).await?;
    tracing::info!(%thread_id, "Deleted thread");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn load_thread(state: &AppState, thread_id: &str) -> ApiResult<Thread> {
    state
        .store
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| ApiError::ThreadNotFound(thread_id.to_string()))
}
