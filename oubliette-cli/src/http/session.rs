//! `/sessions` handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use oubliette_mcp::ops::{
    CallerToolResponseRequest, SessionCleanupRequest, SessionCleanupResponse, SessionEventsRequest,
    SessionEventsResponse, SessionListRequest, SessionListResponse, SessionMessageRequest,
    SessionSendResponse, SessionSpawnRequest,
};

use super::auth::resolve_auth;
use super::error::ServerResult;
use super::state::AppState;

pub async fn spawn(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionSpawnRequest>,
) -> ServerResult<Json<SessionSendResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.session_spawn(&auth, req).await?;
    Ok(Json(resp))
}

pub async fn message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionMessageRequest>,
) -> ServerResult<Json<SessionSendResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.session_message(&auth, req).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    since_index: u64,
    #[serde(default)]
    max_events: Option<usize>,
    #[serde(default)]
    include_children: bool,
}

pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ServerResult<Json<SessionEventsResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let req = SessionEventsRequest {
        session_id,
        since_index: query.since_index,
        max_events: query.max_events,
        include_children: query.include_children,
    };
    let resp = state.dispatcher.session_events(&auth, req).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    project_id: Option<Uuid>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ServerResult<Json<SessionListResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state
        .dispatcher
        .session_list(&auth, SessionListRequest { project_id: query.project_id })
        .await?;
    Ok(Json(resp))
}

pub async fn end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ServerResult<()> {
    let auth = resolve_auth(&state, &headers).await?;
    state.dispatcher.session_end(&auth, &session_id).await?;
    Ok(())
}

pub async fn cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionCleanupRequest>,
) -> ServerResult<Json<SessionCleanupResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.session_cleanup(&auth, req).await?;
    Ok(Json(resp))
}

pub async fn caller_tool_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CallerToolResponseRequest>,
) -> ServerResult<()> {
    let auth = resolve_auth(&state, &headers).await?;
    state.dispatcher.caller_tool_response(&auth, req).await?;
    Ok(())
}
