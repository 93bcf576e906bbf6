use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::DbConfig;

/// Opens the redirects database in WAL mode, creating the file and its
/// parent directory on first use.
pub async fn connect(config: &DbConfig) -> Result<SqlitePool> {
    let db_path = &config.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    tracing::debug!(
        path = %db_path.display(),
        max_connections = config.max_connections,
        "opened redirects database"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_creates_nested_database() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = DbConfig {
            path: tmp.path().join("nested/dir/redirects.sqlite"),
            max_connections: 2,
            busy_timeout_ms: 100,
        };

        let pool = connect(&config).await.unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");
        let timeout: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(Duration::from_millis(timeout as u64), config.busy_timeout());
        assert!(config.path.exists());
    }
}
