//! `/projects` handlers.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use uuid::Uuid;

use oubliette_mcp::ops::{ProjectCreateRequest, ProjectCreateResponse, ProjectListResponse};

use super::auth::resolve_auth;
use super::error::ServerResult;
use super::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProjectCreateRequest>,
) -> ServerResult<Json<ProjectCreateResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.project_create(&auth, req).await?;
    Ok(Json(resp))
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<ProjectListResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.project_list(&auth).await?;
    Ok(Json(resp))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ServerResult<()> {
    let auth = resolve_auth(&state, &headers).await?;
    state.dispatcher.project_delete(&auth, project_id).await?;
    Ok(())
}

pub async fn options(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<oubliette_mcp::ops::ProjectOptionsResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.project_options(&auth).await?;
    Ok(Json(resp))
}

pub async fn config_limits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ServerResult<Json<oubliette_mcp::ops::ConfigLimitsResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state
        .dispatcher
        .config_limits(&auth, oubliette_mcp::ops::ConfigLimitsRequest { project_id })
        .await?;
    Ok(Json(resp))
}

pub async fn workspaces(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ServerResult<Json<oubliette_mcp::ops::WorkspaceListResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.workspace_list(&auth, project_id).await?;
    Ok(Json(resp))
}
