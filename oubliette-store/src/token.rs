//! SQLite-backed `TokenStore`.

use async_trait::async_trait;
use oubliette_core::{Error, Result, Scope, Token, TokenStore};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::sqlite::SqlitePool;
use crate::time::{from_ts, to_ts};

pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_token(row: &Row<'_>) -> rusqlite::Result<Token> {
    let id: String = row.get("id")?;
    let scope: String = row.get("scope")?;
    let revoked: i64 = row.get("revoked")?;
    let created_at: i64 = row.get("created_at")?;
    Ok(Token {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        label: row.get("label")?,
        scope: serde_json::from_str::<Scope>(&scope).unwrap_or(Scope::AdminReadOnly),
        revoked: revoked != 0,
        created_at: from_ts(created_at),
    })
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn save(&self, token: &Token) -> Result<()> {
        let conn = self.pool.lock();
        conn.execute(
            "INSERT INTO tokens (id, label, scope, revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                label = excluded.label, scope = excluded.scope, revoked = excluded.revoked",
            params![
                token.id.to_string(),
                token.label,
                serde_json::to_string(&token.scope).unwrap_or_default(),
                token.revoked as i64,
                to_ts(token.created_at),
            ],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Token>> {
        let conn = self.pool.lock();
        conn.query_row(
            "SELECT * FROM tokens WHERE id = ?1",
            params![id.to_string()],
            row_to_token,
        )
        .optional()
        .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<Token>> {
        let conn = self.pool.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM tokens ORDER BY created_at")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_token)
            .map_err(|e| Error::Internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn revoke(&self, id: Uuid) -> Result<()> {
        let conn = self.pool.lock();
        let changed = conn
            .execute(
                "UPDATE tokens SET revoked = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| Error::Internal(e.to_string()))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("token {id}")));
        }
        Ok(())
    }
}
