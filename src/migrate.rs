use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the `redirects` table and its indexes. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS redirects (
            id TEXT PRIMARY KEY,
            content_id TEXT,
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            code INTEGER NOT NULL,
            respect_params INTEGER NOT NULL DEFAULT 0,
            transfer_params INTEGER NOT NULL DEFAULT 0,
            redirection_type TEXT NOT NULL,
            dimension TEXT NOT NULL,
            stale INTEGER NOT NULL DEFAULT 0,
            updated TEXT NOT NULL,
            last_updated_by TEXT NOT NULL DEFAULT '',
            UNIQUE(dimension, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_redirects_dimension ON redirects(dimension)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_redirects_stale ON redirects(stale)")
        .execute(pool)
        .await?;

    tracing::info!("redirects schema is up to date");
    Ok(())
}
