//! Top-level error types for oubliette-core
//!
//! This module provides a flattened, user-facing error type covering every
//! component in the crate. Each kind maps to exactly one treatment at the
//! MCP boundary (see `oubliette-mcp::error`), so handlers never need to
//! inspect component-specific error enums directly.

use thiserror::Error;

use crate::recursion::RecursionError;
use crate::relay::RelayError;
use crate::session::SessionError;

/// Top-level error type for oubliette-core operations.
///
/// - [`Error::InvalidArgument`] - caller sent something malformed; fix and retry.
/// - [`Error::NotFound`] - the referenced entity does not exist.
/// - [`Error::PermissionDenied`] - scope or session identity mismatch.
/// - [`Error::Conflict`] - a destructive operation collided with live state.
/// - [`Error::ResourceExhausted`] - a recursion, fanout, cost, or buffer limit tripped.
/// - [`Error::DeadlineExceeded`] - a bounded wait (relay, caller-tool) timed out.
/// - [`Error::Unavailable`] - an external dependency (runtime, agent) is down.
/// - [`Error::Internal`] - an invariant was violated; always logged, never swallowed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Errors worth retrying without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::DeadlineExceeded(_))
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::NotFound(format!("session {id}")),
            SessionError::SendInFlight(id) => {
                Self::Conflict(format!("session {id} has a send in flight"))
            }
            SessionError::WorkspaceMismatch { workspace, project } => Self::InvalidArgument(
                format!("workspace {workspace} does not belong to project {project}"),
            ),
            SessionError::InvalidId(id) => {
                Self::InvalidArgument(format!("invalid session id: {id}"))
            }
            SessionError::BufferGap => Self::ResourceExhausted("event buffer gap".to_string()),
            SessionError::StreamEndedWithoutCompletion => {
                Self::Internal("agent event stream ended without completion".to_string())
            }
        }
    }
}

impl From<RecursionError> for Error {
    fn from(err: RecursionError) -> Self {
        Self::ResourceExhausted(err.to_string())
    }
}

impl From<RelayError> for Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Timeout(id) => {
                Self::DeadlineExceeded(format!("caller-tool request {id} timed out"))
            }
            RelayError::SessionMismatch { expected, actual } => Self::PermissionDenied(format!(
                "caller-tool response session {actual} does not match registering session {expected}"
            )),
            RelayError::Unknown(id) => Self::NotFound(format!("caller-tool request {id}")),
            RelayError::PendingSetFull => {
                Self::ResourceExhausted("caller-tool pending set full".to_string())
            }
            RelayError::Io(msg) => Self::Unavailable(msg),
        }
    }
}

/// Result type for oubliette-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(Error::Unavailable("docker down".into()).is_retryable());
        assert!(Error::DeadlineExceeded("relay timeout".into()).is_retryable());
        assert!(!Error::Conflict("session active".into()).is_retryable());
        assert!(!Error::InvalidArgument("bad cron".into()).is_retryable());
    }

    #[test]
    fn test_from_session_error() {
        let err: Error = SessionError::SendInFlight("s1".into()).into();
        assert!(err.is_conflict());

        let err: Error = SessionError::BufferGap.into();
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_from_relay_error_session_mismatch() {
        let err: Error = RelayError::SessionMismatch {
            expected: "s1".into(),
            actual: "s2".into(),
        }
        .into();
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_convenience_methods() {
        assert!(Error::InvalidArgument("x".into()).is_invalid_argument());
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(Error::PermissionDenied("x".into()).is_permission_denied());
        assert!(Error::Conflict("x".into()).is_conflict());
        assert!(Error::ResourceExhausted("x".into()).is_resource_exhausted());
        assert!(Error::DeadlineExceeded("x".into()).is_deadline_exceeded());
        assert!(Error::Unavailable("x".into()).is_unavailable());
        assert!(Error::Internal("x".into()).is_internal());
    }
}
