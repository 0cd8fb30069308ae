//! `/schedules` handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use oubliette_mcp::ops::{
    ScheduleCreateRequest, ScheduleHistoryRequest, ScheduleHistoryResponse, ScheduleListResponse,
    ScheduleResponse, ScheduleUpdateRequest,
};

use super::auth::resolve_auth;
use super::error::ServerResult;
use super::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ScheduleCreateRequest>,
) -> ServerResult<Json<ScheduleResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.schedule_create(&auth, req).await?;
    Ok(Json(resp))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(mut req): Json<ScheduleUpdateRequest>,
) -> ServerResult<Json<ScheduleResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    req.id = id;
    let resp = state.dispatcher.schedule_update(&auth, req).await?;
    Ok(Json(resp))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ServerResult<()> {
    let auth = resolve_auth(&state, &headers).await?;
    state.dispatcher.schedule_delete(&auth, id).await?;
    Ok(())
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<ScheduleListResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.schedule_list(&auth).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(schedule_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ServerResult<Json<ScheduleHistoryResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state
        .dispatcher
        .schedule_history(&auth, ScheduleHistoryRequest { schedule_id, limit: query.limit })
        .await?;
    Ok(Json(resp))
}
