//! SQLite-backed `ScheduleStore`.
//!
//! A schedule's `targets` list is normalized into its own table
//! (`schedule_targets`, keyed by `(schedule_id, idx)`) rather than stored as
//! a JSON blob like `resource_limits`/`isolation` elsewhere in this crate -
//! each target carries its own `last_executed_at`/`last_output` that the
//! scheduler updates independently of the rest of the schedule, so it gets
//! the same row-per-entry treatment as other append-only collections in
//! this store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oubliette_core::Scope;
use oubliette_scheduler::{
    ExecutionOutcome, HistoryRow, OverlapPolicy, Schedule, ScheduleStore, SchedulerError,
    SessionPolicy, Target,
};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::SqlitePool;
use crate::time::{from_ts, from_ts_opt, to_ts, to_ts_opt};

pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn storage_err(e: rusqlite::Error) -> SchedulerError {
    SchedulerError::Storage(e.to_string())
}

fn overlap_str(policy: OverlapPolicy) -> &'static str {
    match policy {
        OverlapPolicy::Skip => "skip",
        OverlapPolicy::Queue => "queue",
        OverlapPolicy::Parallel => "parallel",
    }
}

fn parse_overlap(s: &str) -> OverlapPolicy {
    match s {
        "queue" => OverlapPolicy::Queue,
        "parallel" => OverlapPolicy::Parallel,
        _ => OverlapPolicy::Skip,
    }
}

fn session_policy_str(policy: SessionPolicy) -> &'static str {
    match policy {
        SessionPolicy::Resume => "resume",
        SessionPolicy::New => "new",
    }
}

fn parse_session_policy(s: &str) -> SessionPolicy {
    match s {
        "new" => SessionPolicy::New,
        _ => SessionPolicy::Resume,
    }
}

fn outcome_str(outcome: ExecutionOutcome) -> &'static str {
    match outcome {
        ExecutionOutcome::Success => "success",
        ExecutionOutcome::Failed => "failed",
        ExecutionOutcome::Skipped => "skipped",
    }
}

fn parse_outcome(s: &str) -> ExecutionOutcome {
    match s {
        "failed" => ExecutionOutcome::Failed,
        "skipped" => ExecutionOutcome::Skipped,
        _ => ExecutionOutcome::Success,
    }
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_default()
}

fn row_to_target(row: &Row<'_>) -> rusqlite::Result<Target> {
    let project_id: String = row.get("project_id")?;
    let workspace_id: Option<String> = row.get("workspace_id")?;
    let last_executed_at: Option<i64> = row.get("last_executed_at")?;
    Ok(Target {
        project_id: parse_uuid(project_id),
        workspace_id: workspace_id.map(parse_uuid),
        session_id: row.get("session_id")?,
        last_executed_at: from_ts_opt(last_executed_at),
        last_output: row.get("last_output")?,
    })
}

fn row_to_history(row: &Row<'_>) -> rusqlite::Result<HistoryRow> {
    let schedule_id: String = row.get("schedule_id")?;
    let project_id: String = row.get("project_id")?;
    let workspace_id: Option<String> = row.get("workspace_id")?;
    let status: String = row.get("status")?;
    let executed_at: i64 = row.get("executed_at")?;
    let duration_ms: i64 = row.get("duration_ms")?;
    Ok(HistoryRow {
        schedule_id: parse_uuid(schedule_id),
        project_id: parse_uuid(project_id),
        workspace_id: workspace_id.map(parse_uuid),
        executed_at: from_ts(executed_at),
        status: parse_outcome(&status),
        output: row.get("output")?,
        error: row.get("error")?,
        duration_ms: duration_ms as u64,
    })
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn save(&self, schedule: &Schedule) -> std::result::Result<(), SchedulerError> {
        let mut conn = self.pool.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "INSERT INTO schedules (id, display_name, cron_expression, prompt, overlap_policy,
                session_policy, enabled, creator_identity, creator_scope, next_run_at,
                created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                cron_expression = excluded.cron_expression,
                prompt = excluded.prompt,
                overlap_policy = excluded.overlap_policy,
                session_policy = excluded.session_policy,
                enabled = excluded.enabled,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at",
            params![
                schedule.id.to_string(),
                schedule.display_name,
                schedule.cron_expression,
                schedule.prompt,
                overlap_str(schedule.overlap_policy),
                session_policy_str(schedule.session_policy),
                schedule.enabled as i64,
                schedule.creator_identity,
                serde_json::to_string(&schedule.creator_scope).unwrap_or_default(),
                to_ts_opt(schedule.next_run_at),
                to_ts(schedule.created_at),
                to_ts(schedule.updated_at),
            ],
        )
        .map_err(storage_err)?;

        tx.execute(
            "DELETE FROM schedule_targets WHERE schedule_id = ?1",
            params![schedule.id.to_string()],
        )
        .map_err(storage_err)?;
        for (idx, target) in schedule.targets.iter().enumerate() {
            tx.execute(
                "INSERT INTO schedule_targets
                    (schedule_id, idx, project_id, workspace_id, session_id, last_executed_at, last_output)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    schedule.id.to_string(),
                    idx as i64,
                    target.project_id.to_string(),
                    target.workspace_id.map(|id| id.to_string()),
                    target.session_id,
                    to_ts_opt(target.last_executed_at),
                    target.last_output,
                ],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> std::result::Result<Option<Schedule>, SchedulerError> {
        let conn = self.pool.lock();
        let row = conn
            .query_row(
                "SELECT * FROM schedules WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let display_name: String = row.get("display_name")?;
                    let cron_expression: String = row.get("cron_expression")?;
                    let prompt: String = row.get("prompt")?;
                    let overlap_policy: String = row.get("overlap_policy")?;
                    let session_policy: String = row.get("session_policy")?;
                    let enabled: i64 = row.get("enabled")?;
                    let creator_identity: String = row.get("creator_identity")?;
                    let creator_scope: String = row.get("creator_scope")?;
                    let next_run_at: Option<i64> = row.get("next_run_at")?;
                    let created_at: i64 = row.get("created_at")?;
                    let updated_at: i64 = row.get("updated_at")?;
                    Ok((
                        display_name,
                        cron_expression,
                        prompt,
                        overlap_policy,
                        session_policy,
                        enabled,
                        creator_identity,
                        creator_scope,
                        next_run_at,
                        created_at,
                        updated_at,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;
        let Some((
            display_name,
            cron_expression,
            prompt,
            overlap_policy,
            session_policy,
            enabled,
            creator_identity,
            creator_scope,
            next_run_at,
            created_at,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT * FROM schedule_targets WHERE schedule_id = ?1 ORDER BY idx",
            )
            .map_err(storage_err)?;
        let targets = stmt
            .query_map(params![id.to_string()], row_to_target)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;

        Ok(Some(Schedule {
            id,
            display_name,
            cron_expression,
            prompt,
            targets,
            overlap_policy: parse_overlap(&overlap_policy),
            session_policy: parse_session_policy(&session_policy),
            enabled: enabled != 0,
            creator_identity,
            creator_scope: serde_json::from_str::<Scope>(&creator_scope)
                .unwrap_or(Scope::AdminReadOnly),
            next_run_at: from_ts_opt(next_run_at),
            created_at: from_ts(created_at),
            updated_at: from_ts(updated_at),
        }))
    }

    async fn list(&self) -> std::result::Result<Vec<Schedule>, SchedulerError> {
        let ids = {
            let conn = self.pool.lock();
            let mut stmt = conn
                .prepare("SELECT id FROM schedules ORDER BY created_at")
                .map_err(storage_err)?;
            stmt.query_map([], |row| row.get::<_, String>("id"))
                .map_err(storage_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)?
        };
        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(schedule) = self.get(parse_uuid(id)).await? {
                schedules.push(schedule);
            }
        }
        Ok(schedules)
    }

    async fn delete(&self, id: Uuid) -> std::result::Result<(), SchedulerError> {
        let mut conn = self.pool.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "DELETE FROM schedule_targets WHERE schedule_id = ?1",
            params![id.to_string()],
        )
        .map_err(storage_err)?;
        tx.execute(
            "DELETE FROM schedule_history WHERE schedule_id = ?1",
            params![id.to_string()],
        )
        .map_err(storage_err)?;
        tx.execute("DELETE FROM schedules WHERE id = ?1", params![id.to_string()])
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    async fn append_history(&self, row: HistoryRow) -> std::result::Result<(), SchedulerError> {
        let conn = self.pool.lock();
        conn.execute(
            "INSERT INTO schedule_history
                (schedule_id, project_id, workspace_id, executed_at, status, output, error, duration_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                row.schedule_id.to_string(),
                row.project_id.to_string(),
                row.workspace_id.map(|id| id.to_string()),
                to_ts(row.executed_at),
                outcome_str(row.status),
                row.output,
                row.error,
                row.duration_ms as i64,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn history(
        &self,
        schedule_id: Uuid,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryRow>, SchedulerError> {
        let conn = self.pool.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM schedule_history WHERE schedule_id = ?1
                 ORDER BY executed_at DESC LIMIT ?2",
            )
            .map_err(storage_err)?;
        stmt.query_map(params![schedule_id.to_string(), limit as i64], row_to_history)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oubliette_core::AuthContext;

    fn store() -> SqliteScheduleStore {
        SqliteScheduleStore::new(SqlitePool::open_in_memory().unwrap())
    }

    fn auth() -> AuthContext {
        AuthContext {
            token_id: Uuid::new_v4(),
            scope: Scope::Project(Uuid::new_v4()),
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips_targets() {
        let store = store();
        let mut schedule = Schedule::new("nightly", "0 3 * * *", "run the tests", &auth());
        schedule.targets.push(Target::new(Uuid::new_v4(), None));
        schedule.targets.push(Target::new(Uuid::new_v4(), Some(Uuid::new_v4())));
        store.save(&schedule).await.unwrap();

        let loaded = store.get(schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name, "nightly");
        assert_eq!(loaded.targets.len(), 2);
        assert_eq!(loaded.targets[1].workspace_id, schedule.targets[1].workspace_id);
    }

    #[tokio::test]
    async fn save_upserts_and_replaces_targets() {
        let store = store();
        let mut schedule = Schedule::new("s", "*/5 * * * *", "ping", &auth());
        schedule.targets.push(Target::new(Uuid::new_v4(), None));
        store.save(&schedule).await.unwrap();

        schedule.targets.clear();
        schedule.targets.push(Target::new(Uuid::new_v4(), None));
        schedule.enabled = false;
        store.save(&schedule).await.unwrap();

        let loaded = store.get(schedule.id).await.unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.targets.len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_targets_and_history() {
        let store = store();
        let schedule = Schedule::new("s", "*/5 * * * *", "ping", &auth());
        store.save(&schedule).await.unwrap();
        store
            .append_history(HistoryRow {
                schedule_id: schedule.id,
                project_id: Uuid::new_v4(),
                workspace_id: None,
                executed_at: Utc::now(),
                status: ExecutionOutcome::Success,
                output: Some("done".into()),
                error: None,
                duration_ms: 42,
            })
            .await
            .unwrap();

        store.delete(schedule.id).await.unwrap();
        assert!(store.get(schedule.id).await.unwrap().is_none());
        assert!(store.history(schedule.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_reverse_chronological_and_respects_limit() {
        let store = store();
        let schedule = Schedule::new("s", "*/5 * * * *", "ping", &auth());
        store.save(&schedule).await.unwrap();
        for i in 0..3 {
            store
                .append_history(HistoryRow {
                    schedule_id: schedule.id,
                    project_id: Uuid::new_v4(),
                    workspace_id: None,
                    executed_at: Utc::now() + chrono::Duration::seconds(i),
                    status: ExecutionOutcome::Success,
                    output: Some(format!("run {i}")),
                    error: None,
                    duration_ms: 10,
                })
                .await
                .unwrap();
        }

        let rows = store.history(schedule.id, 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].output.as_deref(), Some("run 2"));
    }
}
