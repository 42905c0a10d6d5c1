//! Job and step-level progress tracking.
//!
//! Pure data access: every pipeline reports into a [`JobTracker`]. Two
//! invariants are enforced in SQL rather than trusted to callers:
//! progress never decreases, and nothing follows a terminal status.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, Result};
use crate::models::{Job, JobStatus, JobStep, JobType};

/// A single status/step/progress change.
#[derive(Debug, Clone)]
pub struct JobUpdate<'a> {
    pub status: JobStatus,
    pub step: &'a str,
    pub progress: i64,
    pub message: Option<String>,
}

impl<'a> JobUpdate<'a> {
    pub fn running(step: &'a str, progress: i64) -> Self {
        Self {
            status: JobStatus::Running,
            step,
            progress,
            message: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            step: "done",
            progress: 100,
            message: None,
        }
    }

    pub fn failed(step: &'a str, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            step,
            progress: 100,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone)]
pub struct JobTracker {
    pool: SqlitePool,
}

impl JobTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job row. Queued jobs are given the next queue position.
    pub async fn create(
        &self,
        job_type: JobType,
        source_id: Option<i64>,
        document_id: Option<&str>,
        status: JobStatus,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let queue_position: Option<i64> = if status == JobStatus::Queued {
            let queued: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
                    .fetch_one(&mut *tx)
                    .await?;
            Some(queued + 1)
        } else {
            None
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, source_id, document_id, status, progress, current_step, queue_position, created_at)
            VALUES (?, ?, ?, ?, 0, 'queued', ?, ?)
            RETURNING id
            "#,
        )
        .bind(job_type.as_str())
        .bind(source_id)
        .bind(document_id)
        .bind(status.as_str())
        .bind(queue_position)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(job_id = id, job_type = job_type.as_str(), "job created");
        Ok(id)
    }

    /// Apply an update and append a step row.
    ///
    /// Returns `false` (and appends nothing) when the job is already
    /// completed or failed. Stored progress is `max(stored, requested)`.
    pub async fn update(&self, job_id: i64, update: JobUpdate<'_>) -> Result<bool> {
        let requested = update.progress.clamp(0, 100);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                current_step = ?,
                progress = MAX(progress, ?),
                message = ?,
                queue_position = CASE WHEN ? = 'queued' THEN queue_position ELSE NULL END
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            RETURNING progress
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.step)
        .bind(requested)
        .bind(&update.message)
        .bind(update.status.as_str())
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(PipelineError::JobNotFound(job_id));
            }
            tracing::warn!(job_id, step = update.step, "ignoring update to finished job");
            return Ok(false);
        };
        let effective: i64 = row.get("progress");

        sqlx::query(
            "INSERT INTO job_steps (job_id, step_name, status, progress, message, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(update.step)
        .bind(update.status.as_str())
        .bind(effective)
        .bind(&update.message)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(
            job_id,
            step = update.step,
            status = update.status.as_str(),
            progress = effective,
            "job updated"
        );
        Ok(true)
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, job_type, source_id, document_id, status, progress, current_step, message, queue_position, created_at FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_job))
    }

    /// All step rows for a job, in insertion order.
    pub async fn steps(&self, job_id: i64) -> Result<Vec<JobStep>> {
        let rows = sqlx::query(
            "SELECT id, job_id, step_name, status, progress, message FROM job_steps WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                JobStep {
                    id: row.get("id"),
                    job_id: row.get("job_id"),
                    step_name: row.get("step_name"),
                    status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
                    progress: row.get("progress"),
                    message: row.get("message"),
                }
            })
            .collect())
    }

    /// Queued and running jobs, queue order first.
    pub async fn list_active(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, source_id, document_id, status, progress, current_step, message, queue_position, created_at
            FROM jobs
            WHERE status IN ('queued', 'running')
            ORDER BY queue_position IS NULL, queue_position, created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_job).collect())
    }
}

/// A tracker bound to one job, handed down through nested pipeline stages.
#[derive(Clone)]
pub struct JobHandle {
    tracker: JobTracker,
    job_id: i64,
}

impl JobHandle {
    pub fn new(tracker: JobTracker, job_id: i64) -> Self {
        Self { tracker, job_id }
    }

    pub fn id(&self) -> i64 {
        self.job_id
    }

    pub async fn step(&self, step: &str, progress: i64) -> Result<()> {
        self.tracker
            .update(self.job_id, JobUpdate::running(step, progress))
            .await
            .map(|_| ())
    }

    pub async fn step_with_message(
        &self,
        step: &str,
        progress: i64,
        message: impl Into<String>,
    ) -> Result<()> {
        self.tracker
            .update(
                self.job_id,
                JobUpdate::running(step, progress).with_message(message),
            )
            .await
            .map(|_| ())
    }

    pub async fn complete(&self, message: Option<String>) -> Result<()> {
        let update = match message {
            Some(m) => JobUpdate::completed().with_message(m),
            None => JobUpdate::completed(),
        };
        self.tracker.update(self.job_id, update).await.map(|_| ())
    }

    pub async fn fail(&self, step: &str, message: impl Into<String>) -> Result<()> {
        self.tracker
            .update(self.job_id, JobUpdate::failed(step, message))
            .await
            .map(|_| ())
    }
}

fn row_to_job(row: &SqliteRow) -> Job {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    Job {
        id: row.get("id"),
        job_type: JobType::parse(&job_type).unwrap_or(JobType::IngestUpload),
        source_id: row.get("source_id"),
        document_id: row.get("document_id"),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        progress: row.get("progress"),
        current_step: row.get("current_step"),
        message: row.get("message"),
        queue_position: row.get("queue_position"),
        created_at: row.get("created_at"),
    }
}
