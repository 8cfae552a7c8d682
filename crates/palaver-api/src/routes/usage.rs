use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UsageQuery {
    #[serde(default)]
    pub guest_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UsageResponse {
    pub guest_id: String,
    pub count: u32,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

/// Guest quota for the current day
#[utoipa::path(
    get,
    path = "/usage",
    params(UsageQuery),
    responses(
        (status = 200, description = "Current usage", body = UsageResponse),
        (status = 400, description = "Missing guest_id")
    ),
    tag = "usage"
)]
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<UsageResponse>> {
    let guest_id = query.guest_id.trim();
    if guest_id.is_empty() {
        return Err(ApiError::BadRequest("guest_id is required".to_string()));
    }

    let usage = state.quota.usage(guest_id);
    Ok(Json(UsageResponse {
        guest_id: guest_id.to_string(),
        count: usage.count,
        remaining: usage.remaining,
        limit: usage.limit,
        reset_at: usage.reset_at,
    }))
}
