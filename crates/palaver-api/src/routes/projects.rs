use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use palaver_persist::Project;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProjectResponse {
    pub project_id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<Project> for ProjectResponse {
    fn from(project: Project) -> Self {
        Self {
            project_id: project.id,
            user_id: project.user_id,
            name: project.name,
            created_at: project.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListProjectsQuery {
    pub user_id: String,
}

/// Create a project to group threads
#[utoipa::path(
    post,
    path = "/projects",
    request_body = CreateProjectRequest,
    responses(
        (status = 201, description = "Project created", body = ProjectResponse),
        (status = 400, description = "Invalid request")
    ),
    tag = "projects"
)]
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectResponse>)> {
    let name = req.name.trim();
    if req.user_id.trim().is_empty() || name.is_empty() {
        return Err(ApiError::BadRequest(
            "user_id and name are required".to_string(),
        ));
    }
    let project = state.store.create_project(&req.user_id, name).await?;
    Ok((StatusCode::CREATED, Json(project.into())))
}

/// List a user's projects
#[utoipa::path(
    get,
    path = "/projects",
    params(ListProjectsQuery),
    responses(
        (status = 200, description = "Projects", body = [ProjectResponse])
    ),
    tag = "projects"
)]
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListProjectsQuery>,
) -> ApiResult<Json<Vec<ProjectResponse>>> {
    let projects = state.store.list_projects(&query.user_id).await?;
    Ok(Json(projects.into_iter().map(ProjectResponse::from).collect()))
}
