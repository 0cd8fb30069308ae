//! `/projects/:id/container` handlers.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use uuid::Uuid;

use oubliette_mcp::ops::{ContainerExecRequest, ContainerExecResponse, ContainerStartResponse};

use super::auth::resolve_auth;
use super::error::ServerResult;
use super::state::AppState;

pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ServerResult<Json<ContainerStartResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.container_start(&auth, project_id).await?;
    Ok(Json(resp))
}

pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ServerResult<Json<ContainerStartResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state
        .dispatcher
        .container_refresh(&auth, oubliette_mcp::ops::ContainerRefreshRequest { project_id })
        .await?;
    Ok(Json(resp))
}

pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> ServerResult<()> {
    let auth = resolve_auth(&state, &headers).await?;
    state.dispatcher.container_stop(&auth, project_id).await?;
    Ok(())
}

pub async fn exec(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ContainerExecRequest>,
) -> ServerResult<Json<ContainerExecResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.container_exec(&auth, req).await?;
    Ok(Json(resp))
}
