//! Server-sent events for a single session's notification stream: session
//! events and caller-tool requests, both pushed through the dispatcher's
//! `NotificationHub`.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use oubliette_core::Access;
use oubliette_mcp::scope::{authorize, resolve_target};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::auth::resolve_auth;
use super::error::ServerResult;
use super::state::AppState;

pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ServerResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let auth = resolve_auth(&state, &headers).await?;
    let target = resolve_target(
        state.dispatcher.sessions.as_ref(),
        None,
        Some(&session_id),
        auth.scope.project_id(),
    )
    .await?;
    authorize(&auth, target, Access::Read)?;

    let rx = state.dispatcher.hub.subscribe(&session_id);
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(notification) => serde_json::to_string(&notification)
            .ok()
            .map(|json| Ok(Event::default().data(json))),
        Err(_lagged) => None,
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
