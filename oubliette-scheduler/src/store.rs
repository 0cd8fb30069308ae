//! Durable storage for schedules and their execution history, implemented
//! by `oubliette-store`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::types::{HistoryRow, Schedule};

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn save(&self, schedule: &Schedule) -> std::result::Result<(), SchedulerError>;
    async fn get(&self, id: Uuid) -> std::result::Result<Option<Schedule>, SchedulerError>;
    async fn list(&self) -> std::result::Result<Vec<Schedule>, SchedulerError>;
    async fn delete(&self, id: Uuid) -> std::result::Result<(), SchedulerError>;
    async fn append_history(&self, row: HistoryRow) -> std::result::Result<(), SchedulerError>;
    /// Reverse-chronological.
    async fn history(
        &self,
        schedule_id: Uuid,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryRow>, SchedulerError>;
}
