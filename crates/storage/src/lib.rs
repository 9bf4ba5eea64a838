use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Durable key-value store for whole-document snapshots.
///
/// Each namespace holds exactly one payload; writes overwrite, never merge.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub namespace: String,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        let storage = Self { pool };
        storage.ensure_snapshot_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_snapshot_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_snapshots (
                namespace  TEXT PRIMARY KEY NOT NULL,
                payload    TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure kv_snapshots table exists")?;
        Ok(())
    }

    /// Replaces the payload stored under `namespace`.
    pub async fn put_snapshot(&self, namespace: &str, payload: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO kv_snapshots (namespace, payload, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(namespace) DO UPDATE SET payload = excluded.payload,
                                                  updated_at = excluded.updated_at",
        )
        .bind(namespace)
        .bind(payload)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write snapshot '{namespace}'"))?;
        debug!(namespace, bytes = payload.len(), "storage: snapshot written");
        Ok(())
    }

    pub async fn get_snapshot(&self, namespace: &str) -> Result<Option<StoredSnapshot>> {
        let row = sqlx::query("SELECT payload, updated_at FROM kv_snapshots WHERE namespace = ?")
            .bind(namespace)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read snapshot '{namespace}'"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload")?;
        let updated_at: String = row.try_get("updated_at")?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .with_context(|| format!("corrupt updated_at for snapshot '{namespace}'"))?
            .with_timezone(&Utc);

        Ok(Some(StoredSnapshot {
            namespace: namespace.to_string(),
            payload,
            updated_at,
        }))
    }

    pub async fn delete_snapshot(&self, namespace: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_snapshots WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete snapshot '{namespace}'"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
