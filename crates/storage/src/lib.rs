use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{Credential, Identity};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Durable home of the single session record. The record is replaced
/// wholesale on login and refresh and erased wholesale on logout.
///
/// There is no locking at this layer; callers treat the store as a
/// single-writer resource.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>>;
    async fn save(&self, credential: &Credential) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid session database url '{database_url}'"))?
            .create_if_missing(true);
        // One connection: an in-memory database is private to its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate session database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self) -> Result<Option<Credential>> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, identity_json FROM session WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to read session record")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let identity_json: String = row.try_get("identity_json")?;
        let identity: Identity = serde_json::from_str(&identity_json)
            .context("stored session identity is not valid json")?;
        Ok(Some(Credential {
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            identity,
        }))
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let identity_json = serde_json::to_string(&credential.identity)?;
        sqlx::query(
            "INSERT INTO session (id, access_token, refresh_token, identity_json, updated_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                identity_json = excluded.identity_json,
                updated_at = excluded.updated_at",
        )
        .bind(&credential.access_token)
        .bind(credential.refresh_token.as_deref())
        .bind(identity_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to write session record")?;
        debug!(
            participant_id = credential.identity.participant_id.0,
            "session: record saved"
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM session")
            .execute(&self.pool)
            .await
            .context("failed to erase session record")?;
        debug!("session: record cleared");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<Credential>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            record: Mutex::new(Some(credential)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Credential>> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        *self.record.lock().await = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.record.lock().await = None;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
