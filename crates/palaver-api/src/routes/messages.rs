use axum::{
    extract::{Path, State},
    Json,
};
use palaver_chat::{reconcile::merge_tool_results, Message};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{error::ApiResult, routes::threads::load_thread, state::AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct ListMessagesResponse {
    pub thread_id: String,
    /// Transcript with tool results folded into their calls
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<Message>,
}

/// Canonical transcript of a thread
#[utoipa::path(
    get,
    path = "/threads/{thread_id}/messages",
    params(("thread_id" = String, Path, description = "Thread ID")),
    responses(
        (status = 200, description = "Reconciled messages", body = ListMessagesResponse),
        (status = 404, description = "Thread not found")
    ),
    tag = "messages"
)]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<ListMessagesResponse>> {
    load_thread(&state, &thread_id).await?;
    let stored = state.store.get_messages(&thread_id).await?;

    Ok(Json(ListMessagesResponse {
        thread_id,
        messages: merge_tool_results(stored),
    }))
}
