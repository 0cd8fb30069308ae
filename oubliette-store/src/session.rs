//! SQLite-backed `SessionStore`.
//!
//! A session row here is pure metadata - the conversation itself lives in
//! the in-memory `EventBuffer` behind `ActiveSession` and is never
//! persisted.
//! This store only durably tracks what `SessionManager` needs to survive a
//! restart: identity, lineage, usage counters, and status.

use async_trait::async_trait;
use oubliette_core::{Session, SessionError, SessionStatus, SessionStore};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::SqlitePool;
use crate::time::{from_ts, to_ts};

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Running => "running",
        SessionStatus::Idle => "idle",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> SessionStatus {
    match s {
        "running" => SessionStatus::Running,
        "idle" => SessionStatus::Idle,
        "completed" => SessionStatus::Completed,
        "failed" => SessionStatus::Failed,
        _ => SessionStatus::Active,
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let project_id: String = row.get("project_id")?;
    let workspace_id: String = row.get("workspace_id")?;
    let status: String = row.get("status")?;
    let tool_allow_list: String = row.get("tool_allow_list")?;
    let tool_deny_list: String = row.get("tool_deny_list")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    Ok(Session {
        id: row.get("id")?,
        project_id: Uuid::parse_str(&project_id).unwrap_or_default(),
        workspace_id: Uuid::parse_str(&workspace_id).unwrap_or_default(),
        parent_id: row.get("parent_id")?,
        root_id: row.get("root_id")?,
        depth: row.get::<_, i64>("depth")? as u32,
        model_id: row.get("model_id")?,
        autonomy_level: row.get("autonomy_level")?,
        reasoning_level: row.get("reasoning_level")?,
        tool_allow_list: serde_json::from_str(&tool_allow_list).unwrap_or_default(),
        tool_deny_list: serde_json::from_str(&tool_deny_list).unwrap_or_default(),
        creator_identity: row.get("creator_identity")?,
        status: parse_status(&status),
        input_tokens: row.get::<_, i64>("input_tokens")? as u64,
        output_tokens: row.get::<_, i64>("output_tokens")? as u64,
        turns: row.get::<_, i64>("turns")? as u32,
        cost_usd: row.get("cost_usd")?,
        runtime_session_id: row.get("runtime_session_id")?,
        last_error: row.get("last_error")?,
        external_id: row.get("external_id")?,
        source: row.get("source")?,
        created_at: from_ts(created_at),
        updated_at: from_ts(updated_at),
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &Session) -> std::result::Result<(), SessionError> {
        let conn = self.pool.lock();
        conn.execute(
            "INSERT INTO sessions (id, project_id, workspace_id, parent_id, root_id, depth,
                model_id, autonomy_level, reasoning_level, tool_allow_list, tool_deny_list,
                creator_identity, status, input_tokens, output_tokens, turns, cost_usd,
                runtime_session_id, last_error, external_id, source, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                turns = excluded.turns,
                cost_usd = excluded.cost_usd,
                runtime_session_id = excluded.runtime_session_id,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                session.id,
                session.project_id.to_string(),
                session.workspace_id.to_string(),
                session.parent_id,
                session.root_id,
                session.depth,
                session.model_id,
                session.autonomy_level,
                session.reasoning_level,
                serde_json::to_string(&session.tool_allow_list).unwrap_or_default(),
                serde_json::to_string(&session.tool_deny_list).unwrap_or_default(),
                session.creator_identity,
                status_str(session.status),
                session.input_tokens as i64,
                session.output_tokens as i64,
                session.turns,
                session.cost_usd,
                session.runtime_session_id,
                session.last_error,
                session.external_id,
                session.source,
                to_ts(session.created_at),
                to_ts(session.updated_at),
            ],
        )
        .map_err(|e| SessionError::InvalidId(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> std::result::Result<Option<Session>, SessionError> {
        let conn = self.pool.lock();
        conn.query_row("SELECT * FROM sessions WHERE id = ?1", params![id], row_to_session)
            .optional()
            .map_err(|e| SessionError::InvalidId(e.to_string()))
    }

    async fn list(
        &self,
        project_id: Option<Uuid>,
    ) -> std::result::Result<Vec<Session>, SessionError> {
        let conn = self.pool.lock();
        let sessions = if let Some(project_id) = project_id {
            let mut stmt = conn
                .prepare("SELECT * FROM sessions WHERE project_id = ?1 ORDER BY created_at")
                .map_err(|e| SessionError::InvalidId(e.to_string()))?;
            stmt.query_map(params![project_id.to_string()], row_to_session)
                .map_err(|e| SessionError::InvalidId(e.to_string()))?
                .collect::<rusqlite::Result<Vec<_>>>()
        } else {
            let mut stmt = conn
                .prepare("SELECT * FROM sessions ORDER BY created_at")
                .map_err(|e| SessionError::InvalidId(e.to_string()))?;
            stmt.query_map([], row_to_session)
                .map_err(|e| SessionError::InvalidId(e.to_string()))?
                .collect::<rusqlite::Result<Vec<_>>>()
        };
        sessions.map_err(|e| SessionError::InvalidId(e.to_string()))
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), SessionError> {
        let conn = self.pool.lock();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(|e| SessionError::InvalidId(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqlitePool;

    fn store() -> SqliteSessionStore {
        SqliteSessionStore::new(SqlitePool::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn save_then_list_scoped_by_project() {
        let store = store();
        let project_a = Uuid::new_v4();
        let project_b = Uuid::new_v4();
        let s1 = Session::new_prime("s1".into(), project_a, Uuid::new_v4(), "claude", "admin");
        let s2 = Session::new_prime("s2".into(), project_b, Uuid::new_v4(), "claude", "admin");
        store.save(&s1).await.unwrap();
        store.save(&s2).await.unwrap();

        let scoped = store.list(Some(project_a)).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, "s1");
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn save_preserves_last_error_through_round_trip() {
        let store = store();
        let mut session =
            Session::new_prime("s1".into(), Uuid::new_v4(), Uuid::new_v4(), "claude", "admin");
        session.fail_with("agent crashed");
        store.save(&session).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("agent crashed"));
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let store = store();
        let session =
            Session::new_prime("s1".into(), Uuid::new_v4(), Uuid::new_v4(), "claude", "admin");
        store.save(&session).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
