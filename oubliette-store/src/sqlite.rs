//! The shared connection handle every store in this crate wraps.
//!
//! A single `rusqlite::Connection` behind a blocking `Mutex`, opened once and
//! schema-initialized via `include_str!`. `rusqlite` has no async story of
//! its own, so every trait method below takes the lock only for the
//! duration of one statement - never across an `.await` - the same
//! discipline the rest of the workspace uses for its `parking_lot`
//! sections.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::StoreError;

/// Handle shared by every `Sqlite*Store` in this crate - one physical
/// SQLite file backs projects, workspaces, sessions, tokens, and
/// schedules, the way a single project directory backs every entity kind
/// in it.
#[derive(Clone)]
pub struct SqlitePool {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePool {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .map_err(StoreError::Schema)?;
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(StoreError::Schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests and for any caller that wants a
    /// throwaway store without a filesystem path.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::Database)?;
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(StoreError::Schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Default on-disk location: `<data_dir>/oubliette/oubliette.db`.
    pub fn default_location() -> Result<Self, StoreError> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(base.join("oubliette").join("oubliette.db"))
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
