//! Wire-facing error shape for the MCP dispatcher.
//!
//! Every dispatcher method returns `DispatchResult<T>`; the caller at the
//! transport boundary (stdio/HTTP MCP framing, out of scope here) converts
//! a `DispatchError` to `{ code, message, data? }` via [`DispatchError::to_wire`].

use serde::Serialize;

/// The small numeric taxonomy from the error handling design: one code per
/// `oubliette_core::Error` kind, plus `InvalidParams` for dispatcher-local
/// validation that never reaches the core (unknown action, bad UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidParams,
    NotFound,
    PermissionDenied,
    Conflict,
    ResourceExhausted,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// JSON-RPC-shaped numeric code, reusing the same ranges the socket
    /// relay's ad hoc errors use for the codes they share (-32601 unknown
    /// method, -32602 invalid params).
    pub fn as_numeric(&self) -> i32 {
        match self {
            ErrorCode::InvalidParams => -32602,
            ErrorCode::NotFound => -32001,
            ErrorCode::PermissionDenied => -32002,
            ErrorCode::Conflict => -32003,
            ErrorCode::ResourceExhausted => -32004,
            ErrorCode::DeadlineExceeded => -32005,
            ErrorCode::Unavailable => -32006,
            ErrorCode::Internal => -32603,
        }
    }
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl DispatchError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidParams,
            message: message.into(),
            data: None,
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.as_numeric(),
            "message": self.message,
            "data": self.data,
        })
    }
}

impl From<oubliette_core::Error> for DispatchError {
    fn from(err: oubliette_core::Error) -> Self {
        let code = match &err {
            oubliette_core::Error::InvalidArgument(_) => ErrorCode::InvalidParams,
            oubliette_core::Error::NotFound(_) => ErrorCode::NotFound,
            oubliette_core::Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            oubliette_core::Error::Conflict(_) => ErrorCode::Conflict,
            oubliette_core::Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            oubliette_core::Error::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            oubliette_core::Error::Unavailable(_) => ErrorCode::Unavailable,
            oubliette_core::Error::Internal(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: err.to_string(),
            data: None,
        }
    }
}

impl From<oubliette_scheduler::SchedulerError> for DispatchError {
    fn from(err: oubliette_scheduler::SchedulerError) -> Self {
        oubliette_core::Error::from(err).into()
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
