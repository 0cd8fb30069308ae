//! Ensures a project's container exists, is running, and has the correct
//! mounts - pulling images on demand and refusing disruptive operations
//! while sessions are live.
//!
//! `ContainerLifecycle` is generic over a [`ContainerRuntime`], the
//! capability set a host container daemon exposes. A single
//! `bollard`-backed implementation is provided; tests exercise the
//! lifecycle against an in-memory `FakeRuntime` instead of a real daemon.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::Project;

/// Opaque handle to a running container, as returned by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerId(pub String);

/// What `ensure_running` asks the runtime to create.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub project_id: Uuid,
    pub image: String,
    /// Host path -> container path.
    pub mounts: Vec<(String, String)>,
    pub env: HashMap<String, String>,
    pub network_isolated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Missing,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("image pull failed for {0}: {1}")]
    PullFailed(String, String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container daemon unavailable: {0}")]
    Unavailable(String),
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(id) => Error::NotFound(format!("container {id}")),
            RuntimeError::PullFailed(..) | RuntimeError::Unavailable(_) => {
                Error::Unavailable(err.to_string())
            }
        }
    }
}

/// The capability set a host container daemon must provide. A single
/// implementation (`BollardRuntime`) is sufficient today; the trait is kept
/// narrow so an alternative runtime can slot in without disturbing
/// `ContainerLifecycle`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ensure_image(&self, image: &str) -> std::result::Result<(), RuntimeError>;
    async fn create(&self, spec: &ContainerSpec) -> std::result::Result<ContainerId, RuntimeError>;
    async fn start(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError>;
    async fn stop(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError>;
    async fn remove(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError>;
    async fn exec(
        &self,
        id: &ContainerId,
        cmd: &[String],
    ) -> std::result::Result<ExecOutput, RuntimeError>;
    async fn inspect(&self, id: &ContainerId) -> std::result::Result<ContainerStatus, RuntimeError>;
    /// Tail of combined stdout/stderr, most recent `tail_lines` lines.
    async fn logs(
        &self,
        id: &ContainerId,
        tail_lines: usize,
    ) -> std::result::Result<String, RuntimeError>;
}

/// Image reference resolution: a key into the configured container-type
/// table, mirroring `oubliette-core::config::ContainerTypeEntry`.
pub trait ImageResolver: Send + Sync {
    fn resolve(&self, container_type: &str) -> Option<String>;
}

struct ProjectContainer {
    id: ContainerId,
    image: String,
}

/// Ensures a per-project container is running with the correct image,
/// mounts, env, and relay socket. One lifecycle instance is shared across
/// all projects; per-project state lives in `containers`.
pub struct ContainerLifecycle<R: ContainerRuntime> {
    runtime: Arc<R>,
    resolver: Arc<dyn ImageResolver>,
    containers: RwLock<HashMap<Uuid, ProjectContainer>>,
    /// Guards concurrent pulls of the same image reference; callers racing
    /// to pull await the single in-flight pull rather than issuing their own.
    pull_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Consulted before `stop`/`remove`/`refresh`: lets the lifecycle refuse a
/// disruptive operation while sessions are live, without depending on
/// `oubliette-core::session` directly (kept as a callback to avoid a
/// circular dependency between the container and session subsystems).
pub trait ActiveSessionCheck: Send + Sync {
    fn has_non_terminal_session(&self, project_id: Uuid) -> bool;
}

impl<R: ContainerRuntime> ContainerLifecycle<R> {
    pub fn new(runtime: Arc<R>, resolver: Arc<dyn ImageResolver>) -> Self {
        Self {
            runtime,
            resolver,
            containers: RwLock::new(HashMap::new()),
            pull_locks: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_image(&self, project: &Project) -> Result<String> {
        self.resolver.resolve(&project.container_type).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unknown container type: {}",
                project.container_type
            ))
        })
    }

    async fn pull_once(&self, image: &str) -> Result<()> {
        let lock = {
            let mut locks = self.pull_locks.lock().await;
            locks
                .entry(image.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        self.runtime.ensure_image(image).await.map_err(Error::from)
    }

    /// Idempotent: creates the container if missing, starts it if stopped,
    /// validates the image matches, and pulls if the image is absent.
    pub async fn ensure_running(&self, project: &Project) -> Result<ContainerId> {
        let image = self.resolve_image(project)?;

        if let Some(existing) = self.containers.read().await.get(&project.id) {
            if existing.image == image {
                match self.runtime.inspect(&existing.id).await.map_err(Error::from)? {
                    ContainerStatus {
                        state: ContainerState::Running,
                        ..
                    } => return Ok(existing.id.clone()),
                    ContainerStatus {
                        state: ContainerState::Stopped,
                        ..
                    } => {
                        self.runtime.start(&existing.id).await.map_err(Error::from)?;
                        return Ok(existing.id.clone());
                    }
                    ContainerStatus {
                        state: ContainerState::Missing,
                        ..
                    } => {} // fall through and recreate
                }
            }
        }

        self.pull_once(&image).await?;
        let mounts = vec![(
            format!("/var/lib/oubliette/projects/{}", project.id),
            "/workspace".to_string(),
        )];
        let spec = ContainerSpec {
            project_id: project.id,
            image: image.clone(),
            mounts,
            env: HashMap::new(),
            network_isolated: project.isolation.network_isolated,
        };
        let id = self.runtime.create(&spec).await.map_err(Error::from)?;
        self.runtime.start(&id).await.map_err(Error::from)?;
        info!(project_id = %project.id, image = %image, "container ensured running");

        self.containers.write().await.insert(
            project.id,
            ProjectContainer {
                id: id.clone(),
                image,
            },
        );
        Ok(id)
    }

    /// Pulls the latest image, then stops and recreates the container.
    /// Fails with `Conflict` if any session of this project is
    /// `active`/`running`.
    pub async fn refresh(
        &self,
        project: &Project,
        sessions: &dyn ActiveSessionCheck,
    ) -> Result<ContainerId> {
        if sessions.has_non_terminal_session(project.id) {
            return Err(Error::Conflict(format!(
                "project {} has an active session, refusing to refresh",
                project.id
            )));
        }
        let image = self.resolve_image(project)?;
        self.pull_once(&image).await?;

        if let Some(existing) = self.containers.write().await.remove(&project.id) {
            self.runtime.stop(&existing.id).await.map_err(Error::from)?;
            self.runtime.remove(&existing.id).await.map_err(Error::from)?;
        }
        info!(project_id = %project.id, "container refreshed");
        self.ensure_running(project).await
    }

    pub async fn stop(&self, project: &Project, sessions: &dyn ActiveSessionCheck) -> Result<()> {
        if sessions.has_non_terminal_session(project.id) {
            return Err(Error::Conflict(format!(
                "project {} has an active session, refusing to stop",
                project.id
            )));
        }
        if let Some(existing) = self.containers.read().await.get(&project.id) {
            self.runtime.stop(&existing.id).await.map_err(Error::from)?;
        }
        Ok(())
    }

    pub async fn remove(&self, project: &Project) -> Result<()> {
        if let Some(existing) = self.containers.write().await.remove(&project.id) {
            let _ = self.runtime.stop(&existing.id).await;
            self.runtime.remove(&existing.id).await.map_err(Error::from)?;
        }
        Ok(())
    }

    pub async fn exec(&self, project_id: Uuid, cmd: Vec<String>) -> Result<ExecOutput> {
        let id = self.container_id_for(project_id).await?;
        self.runtime.exec(&id, &cmd).await.map_err(Error::from)
    }

    pub async fn logs(&self, project_id: Uuid, tail_lines: usize) -> Result<String> {
        let id = self.container_id_for(project_id).await?;
        self.runtime.logs(&id, tail_lines).await.map_err(Error::from)
    }

    async fn container_id_for(&self, project_id: Uuid) -> Result<ContainerId> {
        self.containers
            .read()
            .await
            .get(&project_id)
            .map(|c| c.id.clone())
            .ok_or_else(|| Error::NotFound(format!("no container for project {project_id}")))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory `ContainerRuntime` for testing `ContainerLifecycle` without
    /// a real Docker daemon.
    #[derive(Default)]
    pub struct FakeRuntime {
        next_id: AtomicU64,
        containers: Mutex<HashMap<String, ContainerStatus>>,
        pub pull_count: AtomicU64,
        pub fail_pulls_for: Mutex<Option<String>>,
        pub logs_by_id: Mutex<HashMap<String, String>>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ensure_image(&self, image: &str) -> std::result::Result<(), RuntimeError> {
            self.pull_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_pulls_for.lock().await.as_deref() == Some(image) {
                return Err(RuntimeError::PullFailed(image.to_string(), "forced failure".into()));
            }
            Ok(())
        }

        async fn create(
            &self,
            spec: &ContainerSpec,
        ) -> std::result::Result<ContainerId, RuntimeError> {
            let id = ContainerId(format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
            self.containers.lock().await.insert(
                id.0.clone(),
                ContainerStatus {
                    state: ContainerState::Stopped,
                    image: spec.image.clone(),
                },
            );
            Ok(id)
        }

        async fn start(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError> {
            let mut containers = self.containers.lock().await;
            let status = containers
                .get_mut(&id.0)
                .ok_or_else(|| RuntimeError::NotFound(id.0.clone()))?;
            status.state = ContainerState::Running;
            Ok(())
        }

        async fn stop(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError> {
            let mut containers = self.containers.lock().await;
            let status = containers
                .get_mut(&id.0)
                .ok_or_else(|| RuntimeError::NotFound(id.0.clone()))?;
            status.state = ContainerState::Stopped;
            Ok(())
        }

        async fn remove(&self, id: &ContainerId) -> std::result::Result<(), RuntimeError> {
            self.containers.lock().await.remove(&id.0);
            Ok(())
        }

        async fn exec(
            &self,
            id: &ContainerId,
            cmd: &[String],
        ) -> std::result::Result<ExecOutput, RuntimeError> {
            if !self.containers.lock().await.contains_key(&id.0) {
                return Err(RuntimeError::NotFound(id.0.clone()));
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: cmd.join(" "),
                stderr: String::new(),
            })
        }

        async fn inspect(
            &self,
            id: &ContainerId,
        ) -> std::result::Result<ContainerStatus, RuntimeError> {
            self.containers
                .lock()
                .await
                .get(&id.0)
                .cloned()
                .ok_or(RuntimeError::NotFound(id.0.clone()))
        }

        async fn logs(
            &self,
            id: &ContainerId,
            tail_lines: usize,
        ) -> std::result::Result<String, RuntimeError> {
            if !self.containers.lock().await.contains_key(&id.0) {
                return Err(RuntimeError::NotFound(id.0.clone()));
            }
            let full = self
                .logs_by_id
                .lock()
                .await
                .get(&id.0)
                .cloned()
                .unwrap_or_default();
            Ok(full
                .lines()
                .rev()
                .take(tail_lines)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    impl Clone for ContainerStatus {
        fn clone(&self) -> Self {
            Self {
                state: self.state,
                image: self.image.clone(),
            }
        }
    }

    pub struct NoActiveSessions;
    impl ActiveSessionCheck for NoActiveSessions {
        fn has_non_terminal_session(&self, _project_id: Uuid) -> bool {
            false
        }
    }

    pub struct AlwaysActiveSessions;
    impl ActiveSessionCheck for AlwaysActiveSessions {
        fn has_non_terminal_session(&self, _project_id: Uuid) -> bool {
            true
        }
    }

    pub struct StaticResolver(pub HashMap<String, String>);
    impl ImageResolver for StaticResolver {
        fn resolve(&self, container_type: &str) -> Option<String> {
            self.0.get(container_type).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    fn project(container_type: &str) -> Project {
        Project {
            id: Uuid::new_v4(),
            name: "p".into(),
            source_origin: None,
            container_type: container_type.to_string(),
            credential_refs: vec![],
            default_workspace_id: Uuid::new_v4(),
            resource_limits: Default::default(),
            isolation: Default::default(),
            status: crate::types::ProjectStatus::Active,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn resolver() -> Arc<dyn ImageResolver> {
        let mut map = HashMap::new();
        map.insert("dev".to_string(), "oubliette/agent:latest".to_string());
        Arc::new(StaticResolver(map))
    }

    #[tokio::test]
    async fn test_ensure_running_creates_and_starts() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime.clone(), resolver());
        let project = project("dev");
        let id = lifecycle.ensure_running(&project).await.unwrap();
        let status = runtime.inspect(&id).await.unwrap();
        assert_eq!(status.state, ContainerState::Running);
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime.clone(), resolver());
        let project = project("dev");
        let id1 = lifecycle.ensure_running(&project).await.unwrap();
        let id2 = lifecycle.ensure_running(&project).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_unknown_container_type_is_invalid_argument() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime, resolver());
        let project = project("nonexistent");
        let err = lifecycle.ensure_running(&project).await.unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn test_refresh_conflict_with_active_session() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime, resolver());
        let project = project("dev");
        lifecycle.ensure_running(&project).await.unwrap();
        let err = lifecycle
            .refresh(&project, &AlwaysActiveSessions)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_refresh_recreates_when_no_active_sessions() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime.clone(), resolver());
        let project = project("dev");
        let first = lifecycle.ensure_running(&project).await.unwrap();
        let refreshed = lifecycle.refresh(&project, &NoActiveSessions).await.unwrap();
        assert_ne!(first, refreshed);
        // old container was actually removed
        assert!(runtime.inspect(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_pulls_of_same_image_share_one_pull() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = Arc::new(ContainerLifecycle::new(runtime.clone(), resolver()));
        let mut handles = vec![];
        for _ in 0..5 {
            let lifecycle = lifecycle.clone();
            let project = project("dev");
            handles.push(tokio::spawn(async move {
                lifecycle.ensure_running(&project).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_exec_against_running_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime, resolver());
        let project = project("dev");
        lifecycle.ensure_running(&project).await.unwrap();
        let out = lifecycle
            .exec(project.id, vec!["echo".into(), "hi".into()])
            .await
            .unwrap();
        assert_eq!(out.stdout, "echo hi");
    }

    #[tokio::test]
    async fn test_stop_conflict_with_active_session() {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = ContainerLifecycle::new(runtime, resolver());
        let project = project("dev");
        lifecycle.ensure_running(&project).await.unwrap();
        let err = lifecycle
            .stop(&project, &AlwaysActiveSessions)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
