//! Source administration and lookup.
//!
//! A source is a base path (relative to, or inside, the scan mount root)
//! plus include/exclude glob lists stored as JSON arrays.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, Result};
use crate::models::Source;

#[derive(Clone)]
pub struct SourceStore {
    pool: SqlitePool,
}

impl SourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add(
        &self,
        base_path: &str,
        include_globs: &[String],
        exclude_globs: &[String],
    ) -> Result<Source> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO sources (base_path, include_globs, exclude_globs, enabled, created_at) VALUES (?, ?, ?, 1, ?) RETURNING id",
        )
        .bind(base_path)
        .bind(serde_json::to_string(include_globs)?)
        .bind(serde_json::to_string(exclude_globs)?)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(source_id = id, base_path, "source added");
        self.get(id).await?.ok_or(PipelineError::SourceNotFound(id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, base_path, include_globs, exclude_globs, enabled FROM sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_source).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT id, base_path, include_globs, exclude_globs, enabled FROM sources ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_source).collect()
    }

    pub async fn list_enabled(&self) -> Result<Vec<Source>> {
        Ok(self.list().await?.into_iter().filter(|s| s.enabled).collect())
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::SourceNotFound(id));
        }
        Ok(())
    }

    /// Fetch a source a scan can run against.
    pub async fn load_for_scan(&self, id: i64) -> Result<Source> {
        match self.get(id).await? {
            None => Err(PipelineError::SourceNotFound(id)),
            Some(source) if !source.enabled => Err(PipelineError::SourceDisabled(id)),
            Some(source) => Ok(source),
        }
    }
}

fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let include: String = row.get("include_globs");
    let exclude: String = row.get("exclude_globs");
    Ok(Source {
        id: row.get("id"),
        base_path: row.get("base_path"),
        include_globs: serde_json::from_str(&include)?,
        exclude_globs: serde_json::from_str(&exclude)?,
        enabled: row.get("enabled"),
    })
}
