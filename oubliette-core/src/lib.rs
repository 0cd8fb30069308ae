//! # oubliette-core
//!
//! Shared domain types, session runtime, and error taxonomy for Oubliette -
//! a containerized orchestrator that runs autonomous coding agents as
//! recursively-spawnable sessions behind an MCP-style API.
//!
//! This crate has no knowledge of SQLite or MCP wire framing; it defines
//! the contracts (`SessionStore`, `WorkspaceStore`, `ProjectStore`,
//! `TokenStore`, `SocketRequestHandler`) that `oubliette-store` and
//! `oubliette-mcp` implement, plus the pieces
//! that are fully self-contained here: the event buffer, the normalizer,
//! session runtime state, `SessionManager` orchestration, recursion
//! admission, the caller-tool relay, the `SocketRelay`-backed
//! `StreamingExecutor` (`relay_executor`), and the `ContainerLifecycle` /
//! `ContainerRuntime` abstraction with its `bollard`-backed implementation.

pub mod bollard_runtime;
pub mod buffer;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod executor;
pub mod manager;
pub mod recursion;
pub mod relay;
pub mod relay_executor;
pub mod session;
pub mod socket;
pub mod types;

pub use bollard_runtime::BollardRuntime;
pub use buffer::{EventBuffer, RangeRead, DEFAULT_CAPACITY};
pub use config::{CleanupConfig, Config, ConfigError, ContainerTypeEntry, ModelEntry};
pub use container::{
    ActiveSessionCheck, ContainerId, ContainerLifecycle, ContainerRuntime, ContainerSpec,
    ContainerState, ContainerStatus, ExecOutput, ImageResolver, RuntimeError,
};
pub use error::{Error, Result};
pub use events::{Normalizer, StreamEvent, StreamEventPayload};
pub use executor::{CallerToolDecl, SessionContext, StreamingExecutor, TurnRequest};
pub use manager::{
    ExecutorFactory, ProjectDefaults, SessionManager, SessionManagerSessionCheck, SpawnOverrides,
    SpawnParams, WorkspaceStore,
};
pub use recursion::{RecursionError, RecursionGuard};
pub use relay::{CallerToolRelay, CallerToolSpec, RelayError};
pub use relay_executor::{RelayExecutor, RelayExecutorFactory, RelayRegistry};
pub use session::{
    validate_session_id, ActiveSession, PushSink, Session, SessionError, SessionStatus,
    SessionStore, DEFAULT_CALLER_TOOL_TIMEOUT,
};
pub use socket::{Frame, SocketRelay, SocketRequestHandler};
pub use types::{
    Access, AuthContext, IsolationFlags, Project, ProjectStatus, ProjectStore,
    ResourceLimitOverrides, Scope, Target, Token, TokenStore, Workspace,
};
