use axum::{extract::State, Json};
use palaver_persist::ThreadQuery;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: HashMap<String, String>,
    pub live_sessions: usize,
}

/// Health check endpoint
///
/// Returns the health status of the API and its store
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut services = HashMap::new();

    let probe = state
        .store
        .list_threads(ThreadQuery::for_user("_health_check").limit(1))
        .await;
    let store_status = match probe {
        Ok(_) => "available",
        Err(e) => {
            tracing::warn!(error = %e, "Store health probe failed");
            "unavailable"
        }
    };
    services.insert("store".to_string(), store_status.to_string());

    Json(HealthResponse {
        status: if store_status == "available" { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services,
        live_sessions: state.sessions.len(),
    })
}
