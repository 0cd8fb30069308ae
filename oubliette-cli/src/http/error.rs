//! Maps `DispatchError` (and the auth failures the HTTP layer itself can
//! raise) onto HTTP status codes and the `{ error, code }` body shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use oubliette_mcp::{DispatchError, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("missing or malformed Authorization header")]
    Unauthenticated,

    #[error("token is unknown or revoked")]
    InvalidToken,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, wire) = match &self {
            ServerError::Dispatch(e) => (status_for(e.code), e.to_wire()),
            ServerError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "code": -32000, "message": self.to_string() }),
            ),
            ServerError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "code": -32000, "message": self.to_string() }),
            ),
        };
        (status, Json(wire)).into_response()
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidParams => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
