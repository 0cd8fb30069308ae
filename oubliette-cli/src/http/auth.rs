//! Resolves the `Authorization: Bearer <token-id>` header every handler
//! is given into an `AuthContext`.
//!
//! Tokens carry no secret material (`oubliette-core::Token`'s doc
//! comment) - the transport owns matching a presented credential to a
//! stored token. The presented bearer value is treated as the token's own
//! UUID; a deployment that wants an opaque, unguessable secret instead
//! should mint token ids from a CSPRNG, which `Token::new` already does.

use axum::http::HeaderMap;
use uuid::Uuid;

use oubliette_core::AuthContext;

use super::error::{ServerError, ServerResult};
use super::state::AppState;

pub async fn resolve_auth(state: &AppState, headers: &HeaderMap) -> ServerResult<AuthContext> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServerError::Unauthenticated)?;
    let presented = header
        .strip_prefix("Bearer ")
        .ok_or(ServerError::Unauthenticated)?;
    let token_id = Uuid::parse_str(presented).map_err(|_| ServerError::InvalidToken)?;

    let token = state
        .dispatcher
        .tokens
        .get(token_id)
        .await
        .map_err(oubliette_mcp::DispatchError::from)?
        .ok_or(ServerError::InvalidToken)?;

    if !token.is_usable() {
        return Err(ServerError::InvalidToken);
    }

    Ok(AuthContext {
        token_id: token.id,
        scope: token.scope,
    })
}
