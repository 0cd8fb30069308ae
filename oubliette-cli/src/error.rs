//! Top-level error type for the daemon binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] oubliette_core::ConfigError),

    #[error("storage error: {0}")]
    Store(#[from] oubliette_store::StoreError),

    #[error(transparent)]
    Core(#[from] oubliette_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind http listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type CliResult<T> = Result<T, CliError>;
