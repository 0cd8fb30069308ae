//! Storage-layer error type.
//!
//! `rusqlite` errors are mapped onto `oubliette_core::Error` directly at
//! each trait impl boundary (see `project.rs`, `session.rs`, `token.rs`,
//! `schedule.rs`) since every consumer already speaks that flattened
//! taxonomy; `StoreError` exists only for the pieces - schema setup, the
//! cleanup watchdog - that don't implement one of those traits.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to initialize schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `rusqlite`'s own errors carry no concept of not-found/conflict/etc, so
/// every store maps them to `Internal` here and reserves the more specific
/// `Error` variants for violations the store itself detects.
impl From<StoreError> for oubliette_core::Error {
    fn from(err: StoreError) -> Self {
        oubliette_core::Error::Internal(err.to_string())
    }
}
