//! `/tokens` handlers. Admin-only per `Dispatcher::token_*`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use uuid::Uuid;

use oubliette_mcp::ops::{TokenCreateRequest, TokenCreateResponse, TokenListResponse};

use super::auth::resolve_auth;
use super::error::ServerResult;
use super::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenCreateRequest>,
) -> ServerResult<Json<TokenCreateResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.token_create(&auth, req).await?;
    Ok(Json(resp))
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<TokenListResponse>> {
    let auth = resolve_auth(&state, &headers).await?;
    let resp = state.dispatcher.token_list(&auth).await?;
    Ok(Json(resp))
}

pub async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token_id): Path<Uuid>,
) -> ServerResult<()> {
    let auth = resolve_auth(&state, &headers).await?;
    state.dispatcher.token_revoke(&auth, token_id).await?;
    Ok(())
}
