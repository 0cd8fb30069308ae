//! Schedule, Target, and execution-history data model.

use chrono::{DateTime, Utc};
use oubliette_core::AuthContext;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens when a tick fires while the previous run for the same
/// `(schedule, target)` is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// If a run is in flight, skip this tick and record why.
    Skip,
    /// Intended to queue behind the in-flight run; the current
    /// implementation degrades to `Skip` with a warning (see
    /// `Scheduler::evaluate_target` and DESIGN.md - a real FIFO queue with
    /// per-target concurrency 1 is an open question upstream).
    Queue,
    /// Always execute, regardless of an in-flight run.
    Parallel,
}

/// Whether each run reuses the target's pinned session or always starts fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    Resume,
    New,
}

/// A `(project, workspace?)` pair attached to a schedule, carrying the
/// pinned session id subsequent runs resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub project_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Captured assistant text of the last successful run.
    pub last_output: Option<String>,
}

impl Target {
    pub fn new(project_id: Uuid, workspace_id: Option<Uuid>) -> Self {
        Self {
            project_id,
            workspace_id,
            session_id: None,
            last_executed_at: None,
            last_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub display_name: String,
    pub cron_expression: String,
    pub prompt: String,
    pub targets: Vec<Target>,
    pub overlap_policy: OverlapPolicy,
    pub session_policy: SessionPolicy,
    pub enabled: bool,
    pub creator_identity: String,
    /// The creator token's scope at creation time; a schedule's effective
    /// authorization never changes even if the creator's token is later
    /// re-scoped or revoked.
    pub creator_scope: oubliette_core::Scope,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        display_name: impl Into<String>,
        cron_expression: impl Into<String>,
        prompt: impl Into<String>,
        auth: &AuthContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            cron_expression: cron_expression.into(),
            prompt: prompt.into(),
            targets: Vec::new(),
            overlap_policy: OverlapPolicy::Skip,
            session_policy: SessionPolicy::Resume,
            enabled: true,
            creator_identity: auth.token_id.to_string(),
            creator_scope: auth.scope.clone(),
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `reader` is authorized to see this schedule: listing filters
    /// out schedules whose scope the reader cannot access, reusing the same
    /// permission matrix as the MCP dispatcher but checked against the
    /// *creator's* captured scope.
    pub fn visible_to(&self, reader: &oubliette_core::Scope) -> bool {
        match (reader, &self.creator_scope) {
            (oubliette_core::Scope::Admin, _) => true,
            (oubliette_core::Scope::AdminReadOnly, _) => true,
            (oubliette_core::Scope::Project(p), oubliette_core::Scope::Project(q)) => p == q,
            (oubliette_core::Scope::Project(p), oubliette_core::Scope::ProjectReadOnly(q)) => p == q,
            (oubliette_core::Scope::ProjectReadOnly(p), oubliette_core::Scope::Project(q)) => p == q,
            (oubliette_core::Scope::ProjectReadOnly(p), oubliette_core::Scope::ProjectReadOnly(q)) => p == q,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failed,
    Skipped,
}

/// One append-only row keyed by `(schedule_id, executed_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub schedule_id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionOutcome,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use oubliette_core::Scope;

    fn auth(scope: Scope) -> AuthContext {
        AuthContext {
            token_id: Uuid::new_v4(),
            scope,
        }
    }

    #[test]
    fn test_visible_to_same_project_readonly() {
        let p = Uuid::new_v4();
        let schedule = Schedule::new("s", "*/5 * * * *", "ping", &auth(Scope::Project(p)));
        assert!(schedule.visible_to(&Scope::ProjectReadOnly(p)));
        assert!(!schedule.visible_to(&Scope::ProjectReadOnly(Uuid::new_v4())));
    }

    #[test]
    fn test_admin_sees_everything() {
        let schedule = Schedule::new(
            "s",
            "*/5 * * * *",
            "ping",
            &auth(Scope::Project(Uuid::new_v4())),
        );
        assert!(schedule.visible_to(&Scope::Admin));
        assert!(schedule.visible_to(&Scope::AdminReadOnly));
    }
}
