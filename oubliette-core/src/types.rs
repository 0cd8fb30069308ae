//! Core entities shared across components: projects, workspaces, and the
//! resolved authorization context attached to every call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project: one isolated container plus the workspaces mounted into it.
///
/// Created by an admin action; destroyed atomically (container stopped,
/// directory removed). Referenced by sessions and schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// Where the project's initial contents came from (git URL, blank, etc).
    pub source_origin: Option<String>,
    /// Key into the configured container-type table.
    pub container_type: String,
    /// Named references into credential storage; never secret values.
    pub credential_refs: Vec<String>,
    pub default_workspace_id: Uuid,
    pub resource_limits: ResourceLimitOverrides,
    pub isolation: IsolationFlags,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a project. `Deleting` makes concurrent `project.delete`
/// calls observe a conflict instead of racing to tear down the same container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Deleting,
}

/// Per-project overrides of the default recursion/fanout/cost limits.
/// Any field left `None` falls back to the deployment-wide default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimitOverrides {
    pub max_depth: Option<u32>,
    pub max_agents: Option<u32>,
    pub max_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IsolationFlags {
    /// Run the container with no network access.
    pub network_isolated: bool,
    /// Mount the workspace subtree read-only.
    pub read_only_workspace: bool,
}

impl Project {
    /// True once no further sessions for this project should be admitted.
    pub fn is_deleting(&self) -> bool {
        self.status == ProjectStatus::Deleting
    }
}

/// A filesystem subtree mounted into a project's container.
///
/// A project has exactly one default workspace at creation; additional
/// workspaces can be created on demand. Deleting the default workspace fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new_default(project_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            is_default: true,
            created_at: Utc::now(),
        }
    }

    pub fn new(project_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            is_default: false,
            created_at: Utc::now(),
        }
    }
}

/// The authorization scope carried by a resolved caller identity.
///
/// The core never validates tokens; it consumes an already-resolved
/// `AuthContext` and enforces the permission matrix in the MCP dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub token_id: Uuid,
    pub scope: Scope,
}

/// `admin`, `admin:ro`, `project:<uuid>`, or `project:<uuid>:ro`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Admin,
    AdminReadOnly,
    Project(Uuid),
    ProjectReadOnly(Uuid),
}

/// What an operation is checked against: a global capability, or a
/// capability scoped to one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Global,
    Project(Uuid),
}

/// The level of access an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    Read,
    Write,
    Admin,
}

impl Scope {
    /// Whether this scope permits an operation requiring `(target, access)`.
    /// This is the authoritative matrix from the MCP dispatcher spec.
    pub fn permits(&self, target: Target, access: Access) -> bool {
        match (self, target, access) {
            (Scope::Admin, _, _) => true,
            (Scope::AdminReadOnly, Target::Global, Access::Read) => true,
            (Scope::AdminReadOnly, Target::Project(_), Access::Read) => true,
            (Scope::AdminReadOnly, _, _) => false,
            (Scope::Project(_), Target::Global, Access::Read) => true,
            (Scope::Project(p), Target::Project(q), Access::Read | Access::Write) => p == q,
            (Scope::Project(_), _, _) => false,
            (Scope::ProjectReadOnly(_), Target::Global, Access::Read) => true,
            (Scope::ProjectReadOnly(p), Target::Project(q), Access::Read) => p == q,
            (Scope::ProjectReadOnly(_), _, _) => false,
        }
    }

    /// The project this scope is pinned to, if any.
    pub fn project_id(&self) -> Option<Uuid> {
        match self {
            Scope::Project(p) | Scope::ProjectReadOnly(p) => Some(*p),
            Scope::Admin | Scope::AdminReadOnly => None,
        }
    }
}

/// Durable storage for projects, implemented by `oubliette-store`.
#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save(&self, project: &Project) -> crate::error::Result<()>;
    async fn get(&self, id: Uuid) -> crate::error::Result<Option<Project>>;
    async fn list(&self) -> crate::error::Result<Vec<Project>>;
    async fn delete(&self, id: Uuid) -> crate::error::Result<()>;
}

/// An issued MCP credential. `oubliette-mcp` resolves a bearer credential
/// to a `Token` before building the `AuthContext` it checks operations
/// against; the token itself carries no secret material here, only the
/// scope it grants (the transport layer owns hashing/matching the
/// presented secret, which is out of scope per the Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub label: String,
    pub scope: Scope,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn new(label: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            scope,
            revoked: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.revoked
    }
}

/// Durable storage for tokens, implemented by `oubliette-store`.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, token: &Token) -> crate::error::Result<()>;
    async fn get(&self, id: Uuid) -> crate::error::Result<Option<Token>>;
    async fn list(&self) -> crate::error::Result<Vec<Token>>;
    async fn revoke(&self, id: Uuid) -> crate::error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_permits_everything() {
        let s = Scope::Admin;
        assert!(s.permits(Target::Global, Access::Admin));
        assert!(s.permits(Target::Project(Uuid::new_v4()), Access::Write));
    }

    #[test]
    fn test_project_scope_matches_only_own_project() {
        let p = Uuid::new_v4();
        let other = Uuid::new_v4();
        let s = Scope::Project(p);
        assert!(s.permits(Target::Project(p), Access::Write));
        assert!(!s.permits(Target::Project(other), Access::Write));
        assert!(s.permits(Target::Global, Access::Read));
        assert!(!s.permits(Target::Global, Access::Write));
    }

    #[test]
    fn test_project_readonly_cannot_write() {
        let p = Uuid::new_v4();
        let s = Scope::ProjectReadOnly(p);
        assert!(s.permits(Target::Project(p), Access::Read));
        assert!(!s.permits(Target::Project(p), Access::Write));
    }

    #[test]
    fn test_admin_readonly_cannot_write_global() {
        let s = Scope::AdminReadOnly;
        assert!(s.permits(Target::Global, Access::Read));
        assert!(!s.permits(Target::Global, Access::Write));
        assert!(s.permits(Target::Project(Uuid::new_v4()), Access::Read));
        assert!(!s.permits(Target::Project(Uuid::new_v4()), Access::Write));
    }

    #[test]
    fn test_project_status_deleting() {
        let mut project = Project {
            id: Uuid::new_v4(),
            name: "p".into(),
            source_origin: None,
            container_type: "dev".into(),
            credential_refs: vec![],
            default_workspace_id: Uuid::new_v4(),
            resource_limits: ResourceLimitOverrides::default(),
            isolation: IsolationFlags::default(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!project.is_deleting());
        project.status = ProjectStatus::Deleting;
        assert!(project.is_deleting());
    }
}
