//! SQLite-backed `ProjectStore` and `WorkspaceStore`.

use async_trait::async_trait;
use oubliette_core::{
    Error, IsolationFlags, Project, ProjectStatus, ProjectStore, ResourceLimitOverrides, Result,
    Workspace, WorkspaceStore,
};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::SqlitePool;
use crate::time::{from_ts, to_ts};

pub struct SqliteProjectStore {
    pool: SqlitePool,
}

impl SqliteProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get("status")?;
    let credential_refs: String = row.get("credential_refs")?;
    let resource_limits: String = row.get("resource_limits")?;
    let isolation: String = row.get("isolation")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    Ok(Project {
        id: parse_uuid(row.get::<_, String>("id")?),
        name: row.get("name")?,
        source_origin: row.get("source_origin")?,
        container_type: row.get("container_type")?,
        credential_refs: serde_json::from_str(&credential_refs).unwrap_or_default(),
        default_workspace_id: parse_uuid(row.get::<_, String>("default_workspace_id")?),
        resource_limits: serde_json::from_str::<ResourceLimitOverrides>(&resource_limits)
            .unwrap_or_default(),
        isolation: serde_json::from_str::<IsolationFlags>(&isolation).unwrap_or_default(),
        status: if status == "deleting" {
            ProjectStatus::Deleting
        } else {
            ProjectStatus::Active
        },
        created_at: from_ts(created_at),
        updated_at: from_ts(updated_at),
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_default()
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn save(&self, project: &Project) -> Result<()> {
        let conn = self.pool.lock();
        let status = match project.status {
            ProjectStatus::Active => "active",
            ProjectStatus::Deleting => "deleting",
        };
        conn.execute(
            "INSERT INTO projects (id, name, source_origin, container_type, credential_refs,
                default_workspace_id, resource_limits, isolation, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source_origin = excluded.source_origin,
                container_type = excluded.container_type,
                credential_refs = excluded.credential_refs,
                default_workspace_id = excluded.default_workspace_id,
                resource_limits = excluded.resource_limits,
                isolation = excluded.isolation,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                project.id.to_string(),
                project.name,
                project.source_origin,
                project.container_type,
                serde_json::to_string(&project.credential_refs).unwrap_or_default(),
                project.default_workspace_id.to_string(),
                serde_json::to_string(&project.resource_limits).unwrap_or_default(),
                serde_json::to_string(&project.isolation).unwrap_or_default(),
                status,
                to_ts(project.created_at),
                to_ts(project.updated_at),
            ],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Project>> {
        let conn = self.pool.lock();
        conn.query_row(
            "SELECT * FROM projects WHERE id = ?1",
            params![id.to_string()],
            row_to_project,
        )
        .optional()
        .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let conn = self.pool.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM projects ORDER BY created_at")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_project)
            .map_err(|e| Error::Internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.pool.lock();
        conn.execute("DELETE FROM workspaces WHERE project_id = ?1", params![id.to_string()])
            .map_err(|e| Error::Internal(e.to_string()))?;
        conn.execute("DELETE FROM projects WHERE id = ?1", params![id.to_string()])
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }
}

pub struct SqliteWorkspaceStore {
    pool: SqlitePool,
}

impl SqliteWorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    let created_at: i64 = row.get("created_at")?;
    let is_default: i64 = row.get("is_default")?;
    Ok(Workspace {
        id: parse_uuid(row.get::<_, String>("id")?),
        project_id: parse_uuid(row.get::<_, String>("project_id")?),
        name: row.get("name")?,
        is_default: is_default != 0,
        created_at: from_ts(created_at),
    })
}

#[async_trait]
impl WorkspaceStore for SqliteWorkspaceStore {
    async fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
        let conn = self.pool.lock();
        conn.query_row(
            "SELECT * FROM workspaces WHERE id = ?1",
            params![id.to_string()],
            row_to_workspace,
        )
        .optional()
        .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn default_for_project(&self, project_id: Uuid) -> Result<Option<Workspace>> {
        let conn = self.pool.lock();
        conn.query_row(
            "SELECT * FROM workspaces WHERE project_id = ?1 AND is_default = 1 LIMIT 1",
            params![project_id.to_string()],
            row_to_workspace,
        )
        .optional()
        .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn create(&self, workspace: &Workspace) -> Result<()> {
        let conn = self.pool.lock();
        conn.execute(
            "INSERT INTO workspaces (id, project_id, name, is_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workspace.id.to_string(),
                workspace.project_id.to_string(),
                workspace.name,
                workspace.is_default as i64,
                to_ts(workspace.created_at),
            ],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pool() -> SqlitePool {
        SqlitePool::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = SqliteProjectStore::new(pool());
        let project = Project {
            id: Uuid::new_v4(),
            name: "demo".into(),
            source_origin: Some("https://example.com/repo.git".into()),
            container_type: "default".into(),
            credential_refs: vec!["github".into()],
            default_workspace_id: Uuid::new_v4(),
            resource_limits: ResourceLimitOverrides::default(),
            isolation: IsolationFlags::default(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save(&project).await.unwrap();
        let loaded = store.get(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(loaded.credential_refs, vec!["github".to_string()]);
        assert_eq!(loaded.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn save_upserts_on_conflict() {
        let store = SqliteProjectStore::new(pool());
        let mut project = Project {
            id: Uuid::new_v4(),
            name: "v1".into(),
            source_origin: None,
            container_type: "default".into(),
            credential_refs: vec![],
            default_workspace_id: Uuid::new_v4(),
            resource_limits: ResourceLimitOverrides::default(),
            isolation: IsolationFlags::default(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save(&project).await.unwrap();
        project.name = "v2".into();
        project.status = ProjectStatus::Deleting;
        store.save(&project).await.unwrap();

        let loaded = store.get(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "v2");
        assert_eq!(loaded.status, ProjectStatus::Deleting);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_project_and_its_workspaces() {
        let pool = pool();
        let projects = SqliteProjectStore::new(pool.clone());
        let workspaces = SqliteWorkspaceStore::new(pool);
        let project_id = Uuid::new_v4();
        let project = Project {
            id: project_id,
            name: "p".into(),
            source_origin: None,
            container_type: "default".into(),
            credential_refs: vec![],
            default_workspace_id: Uuid::new_v4(),
            resource_limits: ResourceLimitOverrides::default(),
            isolation: IsolationFlags::default(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        projects.save(&project).await.unwrap();
        let ws = Workspace::new_default(project_id, "main");
        workspaces.create(&ws).await.unwrap();

        projects.delete(project_id).await.unwrap();
        assert!(projects.get(project_id).await.unwrap().is_none());
        assert!(workspaces.get(ws.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn default_for_project_finds_the_flagged_workspace() {
        let pool = pool();
        let workspaces = SqliteWorkspaceStore::new(pool);
        let project_id = Uuid::new_v4();
        let ws = Workspace::new_default(project_id, "main");
        workspaces.create(&ws).await.unwrap();

        let found = workspaces.default_for_project(project_id).await.unwrap().unwrap();
        assert_eq!(found.id, ws.id);
        assert!(found.is_default);
    }
}
