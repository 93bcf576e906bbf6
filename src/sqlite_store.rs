//! SQLite-backed [`RedirectStore`] implementation.
//!
//! Bulk writes are split into chunks of `store.batch_size` definitions.
//! Each chunk runs in its own transaction and is retried up to
//! `store.max_retries` times with a fixed backoff. [`RedirectStore::apply`]
//! writes everything in a single transaction instead, so a consolidation
//! lands completely or not at all. Every failure surfaces as
//! [`RedirectError::StoreUnavailable`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::warn;

use redirects_core::store::{DimensionSnapshot, RedirectStore, SearchFilter};
use redirects_core::{
    Dimension, EntityId, RedirectCode, RedirectDefinition, RedirectError, RedirectionType, Result,
};

use crate::config::StoreConfig;

const COLUMNS: &str = "id, content_id, source, target, code, respect_params, transfer_params, \
                       redirection_type, dimension, stale, updated, last_updated_by";

/// SQLite implementation of the [`RedirectStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::from_config(pool, &StoreConfig::default())
    }

    pub fn from_config(pool: SqlitePool, config: &StoreConfig) -> Self {
        Self {
            pool,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries.max(1),
            retry_backoff: config.retry_backoff(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn with_retry<F, Fut>(&self, op: &str, attempt_fn: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), sqlx::Error>>,
    {
        retry(op, self.max_retries, self.retry_backoff, attempt_fn).await
    }

    async fn upsert_chunk(&self, chunk: &[RedirectDefinition]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        upsert_rows(&mut tx, chunk).await?;
        tx.commit().await
    }

    async fn delete_chunk(&self, chunk: &[EntityId]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        delete_rows(&mut tx, chunk).await?;
        tx.commit().await
    }

    async fn apply_once(
        &self,
        upserts: &[RedirectDefinition],
        deletes: &[EntityId],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        upsert_rows(&mut tx, upserts).await?;
        delete_rows(&mut tx, deletes).await?;
        tx.commit().await
    }
}

/// Runs `attempt_fn` up to `max_retries` times, sleeping `backoff` between
/// attempts.
async fn retry<F, Fut>(op: &str, max_retries: u32, backoff: Duration, mut attempt_fn: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < max_retries => {
                warn!(op, attempt, error = %e, "store write failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(RedirectError::unavailable(format!(
                    "{op} failed after {attempt} attempts: {e}"
                )))
            }
        }
    }
}

async fn upsert_rows(
    conn: &mut SqliteConnection,
    definitions: &[RedirectDefinition],
) -> std::result::Result<(), sqlx::Error> {
    for def in definitions {
        // Keep (dimension, source) unique: a new id for an existing source replaces it.
        sqlx::query("DELETE FROM redirects WHERE dimension = ? AND source = ? AND id != ?")
            .bind(def.dimension.as_str())
            .bind(&def.source)
            .bind(def.id.as_str())
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO redirects (id, content_id, source, target, code, respect_params,
                                   transfer_params, redirection_type, dimension, stale,
                                   updated, last_updated_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content_id = excluded.content_id,
                source = excluded.source,
                target = excluded.target,
                code = excluded.code,
                respect_params = excluded.respect_params,
                transfer_params = excluded.transfer_params,
                redirection_type = excluded.redirection_type,
                dimension = excluded.dimension,
                stale = excluded.stale,
                updated = excluded.updated,
                last_updated_by = excluded.last_updated_by
            "#,
        )
        .bind(def.id.as_str())
        .bind(&def.content_id)
        .bind(&def.source)
        .bind(&def.target)
        .bind(i64::from(def.code.as_u16()))
        .bind(def.respect_params)
        .bind(def.transfer_params)
        .bind(def.redirection_type.as_str())
        .bind(def.dimension.as_str())
        .bind(def.stale)
        .bind(def.updated.to_rfc3339())
        .bind(&def.last_updated_by)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn delete_rows(
    conn: &mut SqliteConnection,
    ids: &[EntityId],
) -> std::result::Result<(), sqlx::Error> {
    for id in ids {
        sqlx::query("DELETE FROM redirects WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn store_error(e: sqlx::Error) -> RedirectError {
    RedirectError::unavailable(e.to_string())
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> RedirectError {
    RedirectError::unavailable(format!("corrupt redirects row, column {column}: {detail}"))
}

fn row_to_definition(row: &SqliteRow) -> Result<RedirectDefinition> {
    let code: i64 = row.try_get("code").map_err(store_error)?;
    let code = u16::try_from(code)
        .map_err(|e| corrupt("code", e))
        .and_then(|c| RedirectCode::try_from(c).map_err(|e| corrupt("code", e)))?;

    let redirection_type: String = row.try_get("redirection_type").map_err(store_error)?;
    let redirection_type: RedirectionType = redirection_type
        .parse()
        .map_err(|e| corrupt("redirection_type", e))?;

    let updated: String = row.try_get("updated").map_err(store_error)?;
    let updated = DateTime::parse_from_rfc3339(&updated)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt("updated", e))?;

    Ok(RedirectDefinition {
        id: EntityId::from(row.try_get::<String, _>("id").map_err(store_error)?),
        content_id: row.try_get("content_id").map_err(store_error)?,
        source: row.try_get("source").map_err(store_error)?,
        target: row.try_get("target").map_err(store_error)?,
        code,
        respect_params: row.try_get("respect_params").map_err(store_error)?,
        transfer_params: row.try_get("transfer_params").map_err(store_error)?,
        redirection_type,
        dimension: Dimension::from(row.try_get::<String, _>("dimension").map_err(store_error)?),
        stale: row.try_get("stale").map_err(store_error)?,
        updated,
        last_updated_by: row.try_get("last_updated_by").map_err(store_error)?,
    })
}

fn rows_to_definitions(rows: &[SqliteRow]) -> Result<Vec<RedirectDefinition>> {
    rows.iter().map(row_to_definition).collect()
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl RedirectStore for SqliteStore {
    async fn find_all_by_dimension(
        &self,
        dimension: &Dimension,
        only_active: bool,
    ) -> Result<Vec<RedirectDefinition>> {
        let mut sql = format!("SELECT {COLUMNS} FROM redirects WHERE dimension = ?");
        if only_active {
            sql.push_str(" AND stale = 0 AND target != ''");
        }
        sql.push_str(" ORDER BY source");

        let rows = sqlx::query(&sql)
            .bind(dimension.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows_to_definitions(&rows)
    }

    async fn find_all(&self, only_active: bool) -> Result<DimensionSnapshot> {
        let mut sql = format!("SELECT {COLUMNS} FROM redirects");
        if only_active {
            sql.push_str(" WHERE stale = 0 AND target != ''");
        }

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let mut snapshot = DimensionSnapshot::new();
        for def in rows_to_definitions(&rows)? {
            snapshot
                .entry(def.dimension.clone())
                .or_default()
                .insert(def.source.clone(), def);
        }
        Ok(snapshot)
    }

    async fn find(&self, id: &EntityId) -> Result<Option<RedirectDefinition>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM redirects WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.as_ref().map(row_to_definition).transpose()
    }

    async fn upsert_many(&self, definitions: &[RedirectDefinition]) -> Result<()> {
        for chunk in definitions.chunks(self.batch_size) {
            self.with_retry("upsert", || self.upsert_chunk(chunk)).await?;
        }
        Ok(())
    }

    async fn delete_many(&self, ids: &[EntityId]) -> Result<()> {
        for chunk in ids.chunks(self.batch_size) {
            self.with_retry("delete", || self.delete_chunk(chunk)).await?;
        }
        Ok(())
    }

    async fn apply(&self, upserts: &[RedirectDefinition], deletes: &[EntityId]) -> Result<()> {
        if upserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        self.with_retry("apply", || self.apply_once(upserts, deletes)).await
    }

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<RedirectDefinition>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM redirects WHERE 1 = 1"));

        if let Some(dimension) = &filter.dimension {
            qb.push(" AND dimension = ").push_bind(dimension.as_str().to_string());
        }
        if let Some(needle) = &filter.source_contains {
            qb.push(" AND LOWER(source) LIKE ")
                .push_bind(format!("%{}%", escape_like(&needle.to_lowercase())))
                .push(" ESCAPE '\\'");
        }
        if let Some(kind) = filter.redirection_type {
            qb.push(" AND redirection_type = ").push_bind(kind.as_str());
        }
        match filter.active {
            Some(true) => {
                qb.push(" AND stale = 0 AND target != ''");
            }
            Some(false) => {
                qb.push(" AND (stale = 1 OR target = '')");
            }
            None => {}
        }
        qb.push(" ORDER BY source");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        rows_to_definitions(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("/plain"), "/plain");
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let backoff = Duration::from_millis(10);
        let started = std::time::Instant::now();

        let err = retry("upsert", 3, backoff, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(sqlx::Error::PoolTimedOut) }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= backoff * 2);
        assert!(matches!(err, RedirectError::StoreUnavailable(_)));
        assert!(err.to_string().contains("upsert failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let attempts = AtomicU32::new(0);

        retry("delete", 5, Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err::<(), _>(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
