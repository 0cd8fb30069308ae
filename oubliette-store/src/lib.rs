//! SQLite-backed persistence for Oubliette.
//!
//! One physical database file backs every durable store trait from
//! `oubliette-core` and `oubliette-scheduler` - projects, workspaces,
//! sessions, tokens, and schedules behind one connection handle. The
//! cleanup/backup watchdog lives here too since it operates on the same
//! project-scoped state this crate persists.

pub mod cleanup;
pub mod error;
pub mod project;
pub mod schedule;
pub mod session;
pub mod sqlite;
pub mod time;
pub mod token;

pub use cleanup::{CleanupReport, CleanupWatchdog};
pub use error::StoreError;
pub use project::{SqliteProjectStore, SqliteWorkspaceStore};
pub use schedule::SqliteScheduleStore;
pub use session::SqliteSessionStore;
pub use sqlite::SqlitePool;
pub use token::SqliteTokenStore;
