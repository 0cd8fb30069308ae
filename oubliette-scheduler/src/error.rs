use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("schedule not found: {0}")]
    NotFound(uuid::Uuid),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<SchedulerError> for oubliette_core::Error {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidCron(msg) => oubliette_core::Error::InvalidArgument(msg),
            SchedulerError::NotFound(id) => oubliette_core::Error::NotFound(format!("schedule {id}")),
            SchedulerError::Storage(msg) => oubliette_core::Error::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
