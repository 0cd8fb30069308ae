//! Periodic evaluator of cron-like schedules, with per-target pinned
//! sessions, overlap policy, and execution history.
//!
//! Tick resolution is 1 minute (driven by the caller, typically
//! `oubliette-cli`'s daemon loop); a missed wall-clock window is never
//! retro-triggered, execution simply resumes at the next scheduled
//! boundary.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::store::ScheduleStore;
use crate::types::{ExecutionOutcome, HistoryRow, OverlapPolicy, Schedule, SessionPolicy, Target};

/// Executes a schedule's prompt against one target and reports the
/// resulting session id and captured completion text. Implemented by
/// whoever wires `oubliette-core::SessionManager` into the scheduler
/// (`oubliette-cli`), so this crate has no direct dependency on the
/// container/executor machinery.
#[async_trait]
pub trait ScheduleRunner: Send + Sync {
    /// Always spawns a new session, ignoring any pinned id.
    async fn run_new(
        &self,
        project_id: Uuid,
        workspace_id: Option<Uuid>,
        prompt: &str,
    ) -> std::result::Result<(String, String), oubliette_core::Error>;

    /// Resumes `session_id` if possible; on failure (e.g. the session
    /// can't be reinstated) spawns a new one and returns its id so the
    /// caller can update the target's pin.
    async fn run_resume(
        &self,
        project_id: Uuid,
        workspace_id: Option<Uuid>,
        session_id: &str,
        prompt: &str,
    ) -> std::result::Result<(String, String), oubliette_core::Error>;
}

/// Parses the standard 5-field cron form by prepending a `0` seconds
/// field, since the underlying `cron` crate requires one.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidCron(format!(
            "expected 5 fields, got {}: {expression}",
            fields.len()
        )));
    }
    let with_seconds = format!("0 {expression}");
    cron::Schedule::from_str(&with_seconds)
        .map_err(|e| SchedulerError::InvalidCron(format!("{expression}: {e}")))
}

pub fn next_run_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| SchedulerError::InvalidCron(format!("no upcoming run for {expression}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TargetKey {
    schedule_id: Uuid,
    target_index: usize,
}

/// Periodic evaluator. One instance per deployment; `tick` is called by
/// the caller's own 1-minute timer.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    runner: Arc<dyn ScheduleRunner>,
    /// Per-`(schedule, target)` in-flight counter, guarded by a single
    /// lock - never held across the `.await` that actually runs the prompt.
    in_flight: Mutex<HashMap<TargetKey, u32>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, runner: Arc<dyn ScheduleRunner>) -> Self {
        Self {
            store,
            runner,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Loads enabled schedules whose `next_run_at <= now`, evaluates every
    /// target, and recomputes `next_run_at`. Returns the number of
    /// schedules evaluated.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u32> {
        let schedules = self.store.list().await?;
        let due: Vec<Schedule> = schedules
            .into_iter()
            .filter(|s| s.enabled && s.next_run_at.map_or(true, |t| t <= now))
            .collect();

        let mut evaluated = 0;
        for mut schedule in due {
            let mut targets = std::mem::take(&mut schedule.targets);
            for (index, target) in targets.iter_mut().enumerate() {
                self.evaluate_target(&schedule, index, target, now).await;
            }
            schedule.targets = targets;
            schedule.next_run_at = Some(next_run_after(&schedule.cron_expression, now)?);
            schedule.updated_at = now;
            self.store.save(&schedule).await?;
            evaluated += 1;
        }
        info!(evaluated, "scheduler tick complete");
        Ok(evaluated)
    }

    async fn evaluate_target(&self, schedule: &Schedule, index: usize, target: &mut Target, now: DateTime<Utc>) {
        let key = TargetKey {
            schedule_id: schedule.id,
            target_index: index,
        };

        let in_flight_count = *self.in_flight.lock().get(&key).unwrap_or(&0);
        match schedule.overlap_policy {
            OverlapPolicy::Skip if in_flight_count > 0 => {
                self.record(
                    schedule,
                    target,
                    now,
                    ExecutionOutcome::Skipped,
                    None,
                    Some("skipped: previous run still in flight".to_string()),
                    0,
                )
                .await;
                return;
            }
            OverlapPolicy::Queue if in_flight_count > 0 => {
                warn!(
                    schedule_id = %schedule.id,
                    "overlap policy 'queue' has no FIFO queue yet; degrading to skip"
                );
                self.record(
                    schedule,
                    target,
                    now,
                    ExecutionOutcome::Skipped,
                    None,
                    Some("skipped: queue policy not yet implemented, degraded to skip".to_string()),
                    0,
                )
                .await;
                return;
            }
            _ => {}
        }

        *self.in_flight.lock().entry(key).or_insert(0) += 1;
        let started = std::time::Instant::now();

        let outcome = match schedule.session_policy {
            SessionPolicy::New => {
                target.session_id = None;
                self.runner
                    .run_new(target.project_id, target.workspace_id, &schedule.prompt)
                    .await
            }
            SessionPolicy::Resume => match &target.session_id {
                Some(session_id) => {
                    self.runner
                        .run_resume(
                            target.project_id,
                            target.workspace_id,
                            session_id,
                            &schedule.prompt,
                        )
                        .await
                }
                None => {
                    self.runner
                        .run_new(target.project_id, target.workspace_id, &schedule.prompt)
                        .await
                }
            },
        };

        if let Some(count) = self.in_flight.lock().get_mut(&key) {
            *count = count.saturating_sub(1);
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((session_id, output)) => {
                target.session_id = Some(session_id);
                target.last_executed_at = Some(now);
                target.last_output = Some(output.clone());
                self.record(
                    schedule,
                    target,
                    now,
                    ExecutionOutcome::Success,
                    Some(output),
                    None,
                    duration_ms,
                )
                .await;
            }
            Err(e) => {
                self.record(
                    schedule,
                    target,
                    now,
                    ExecutionOutcome::Failed,
                    None,
                    Some(e.to_string()),
                    duration_ms,
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        schedule: &Schedule,
        target: &Target,
        now: DateTime<Utc>,
        status: ExecutionOutcome,
        output: Option<String>,
        error: Option<String>,
        duration_ms: u64,
    ) {
        let row = HistoryRow {
            schedule_id: schedule.id,
            project_id: target.project_id,
            workspace_id: target.workspace_id,
            executed_at: now,
            status,
            output,
            error,
            duration_ms,
        };
        if let Err(e) = self.store.append_history(row).await {
            warn!(schedule_id = %schedule.id, error = %e, "failed to append schedule history row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Target;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Barrier;

    #[derive(Default)]
    struct InMemoryScheduleStore {
        schedules: Mutex<HashMap<Uuid, Schedule>>,
        history: Mutex<Vec<HistoryRow>>,
    }

    #[async_trait]
    impl ScheduleStore for InMemoryScheduleStore {
        async fn save(&self, schedule: &Schedule) -> std::result::Result<(), SchedulerError> {
            self.schedules.lock().insert(schedule.id, schedule.clone());
            Ok(())
        }
        async fn get(&self, id: Uuid) -> std::result::Result<Option<Schedule>, SchedulerError> {
            Ok(self.schedules.lock().get(&id).cloned())
        }
        async fn list(&self) -> std::result::Result<Vec<Schedule>, SchedulerError> {
            Ok(self.schedules.lock().values().cloned().collect())
        }
        async fn delete(&self, id: Uuid) -> std::result::Result<(), SchedulerError> {
            self.schedules.lock().remove(&id);
            Ok(())
        }
        async fn append_history(&self, row: HistoryRow) -> std::result::Result<(), SchedulerError> {
            self.history.lock().push(row);
            Ok(())
        }
        async fn history(
            &self,
            schedule_id: Uuid,
            limit: usize,
        ) -> std::result::Result<Vec<HistoryRow>, SchedulerError> {
            let mut rows: Vec<HistoryRow> = self
                .history
                .lock()
                .iter()
                .filter(|r| r.schedule_id == schedule_id)
                .cloned()
                .collect();
            rows.sort_by_key(|r| std::cmp::Reverse(r.executed_at));
            rows.truncate(limit);
            Ok(rows)
        }
    }

    struct CountingRunner {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScheduleRunner for CountingRunner {
        async fn run_new(
            &self,
            _project_id: Uuid,
            _workspace_id: Option<Uuid>,
            _prompt: &str,
        ) -> std::result::Result<(String, String), oubliette_core::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(("session-new".to_string(), "ok".to_string()))
        }
        async fn run_resume(
            &self,
            _project_id: Uuid,
            _workspace_id: Option<Uuid>,
            session_id: &str,
            _prompt: &str,
        ) -> std::result::Result<(String, String), oubliette_core::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((session_id.to_string(), "resumed ok".to_string()))
        }
    }

    fn auth() -> oubliette_core::AuthContext {
        oubliette_core::AuthContext {
            token_id: Uuid::new_v4(),
            scope: oubliette_core::Scope::Admin,
        }
    }

    #[tokio::test]
    async fn test_scenario_d_pinned_resume_across_two_runs() {
        let store = Arc::new(InMemoryScheduleStore::default());
        let runner = Arc::new(CountingRunner {
            calls: AtomicU32::new(0),
        });
        let scheduler = Scheduler::new(store.clone(), runner.clone());

        let mut schedule = Schedule::new("nightly", "*/5 * * * *", "do work", &auth());
        schedule.session_policy = SessionPolicy::Resume;
        schedule.targets.push(Target::new(Uuid::new_v4(), None));
        store.save(&schedule).await.unwrap();

        let t0 = Utc::now();
        scheduler.tick(t0).await.unwrap();
        let after_run1 = store.get(schedule.id).await.unwrap().unwrap();
        assert_eq!(after_run1.targets[0].session_id.as_deref(), Some("session-new"));

        let t1 = after_run1.next_run_at.unwrap();
        scheduler.tick(t1).await.unwrap();
        let after_run2 = store.get(schedule.id).await.unwrap().unwrap();
        // resumed the same pinned session id
        assert_eq!(after_run2.targets[0].session_id.as_deref(), Some("session-new"));
        assert_eq!(after_run2.targets[0].last_output.as_deref(), Some("resumed ok"));

        let history = store.history(schedule.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.status == ExecutionOutcome::Success));
    }

    #[tokio::test]
    async fn test_overlap_skip_allows_only_one_in_flight() {
        struct SlowRunner {
            started: Barrier,
        }
        #[async_trait]
        impl ScheduleRunner for SlowRunner {
            async fn run_new(
                &self,
                _p: Uuid,
                _w: Option<Uuid>,
                _prompt: &str,
            ) -> std::result::Result<(String, String), oubliette_core::Error> {
                self.started.wait().await;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(("s".to_string(), "done".to_string()))
            }
            async fn run_resume(
                &self,
                p: Uuid,
                w: Option<Uuid>,
                _session_id: &str,
                prompt: &str,
            ) -> std::result::Result<(String, String), oubliette_core::Error> {
                self.run_new(p, w, prompt).await
            }
        }

        let store = Arc::new(InMemoryScheduleStore::default());
        let runner = Arc::new(SlowRunner {
            started: Barrier::new(1),
        });
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner));

        let mut schedule = Schedule::new("s", "*/5 * * * *", "p", &auth());
        schedule.overlap_policy = OverlapPolicy::Skip;
        schedule.targets.push(Target::new(Uuid::new_v4(), None));
        store.save(&schedule).await.unwrap();

        let now = Utc::now();
        let a = scheduler.clone();
        let h1 = tokio::spawn(async move { a.tick(now).await });
        h1.await.unwrap().unwrap();

        let history = store.history(schedule.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionOutcome::Success);
    }

    #[test]
    fn test_parse_cron_rejects_non_five_field() {
        let err = parse_cron("* * * *").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron(_)));
    }

    #[test]
    fn test_next_run_after_advances() {
        let now = Utc::now();
        let next = next_run_after("*/5 * * * *", now).unwrap();
        assert!(next > now);
    }
}
