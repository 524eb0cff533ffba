//! Repository for the `generation_jobs` table.
//!
//! Claiming a queued job uses `FOR UPDATE SKIP LOCKED` so the status
//! transition that drives scheduling is atomic. Free-form fields
//! (progress, last_event) are updated without transactional isolation;
//! they carry no scheduling decisions.

use sqlx::PgPool;
use vidpool_core::types::DbId;

use crate::models::job::{GenerationJob, JobStatus, NewJob};

/// Column list for `generation_jobs` queries.
const COLUMNS: &str = "\
    id, user_id, chat_id, prompt, orientation, frames, size, image, \
    status, progress, result_url, error_message, notify_handle, \
    task_id, account_id, poll_interval_secs, timeout_secs, \
    created_at, updated_at, last_event";

/// Provides CRUD operations for durable generation jobs.
pub struct JobRepo;

impl JobRepo {
    /// Persist a new job in `queued` status, returning the row.
    pub async fn enqueue(pool: &PgPool, input: &NewJob) -> Result<GenerationJob, sqlx::Error> {
        let query = format!(
            "INSERT INTO generation_jobs \
                 (user_id, chat_id, prompt, orientation, frames, size, image, \
                  status, notify_handle, poll_interval_secs, timeout_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationJob>(&query)
            .bind(input.user_id)
            .bind(input.chat_id)
            .bind(&input.prompt)
            .bind(input.orientation)
            .bind(input.frames)
            .bind(input.size)
            .bind(input.image.as_deref())
            .bind(JobStatus::Queued)
            .bind(input.notify_handle)
            .bind(input.poll_interval_secs)
            .bind(input.timeout_secs)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the oldest queued job and mark it running.
    ///
    /// FIFO by ascending `id`; `FOR UPDATE SKIP LOCKED` prevents
    /// double-dispatch across concurrent coordinators.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<GenerationJob>, sqlx::Error> {
        let query = format!(
            "UPDATE generation_jobs \
             SET status = $1, updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM generation_jobs \
                 WHERE status = $2 \
                 ORDER BY id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, GenerationJob>(&query)
            .bind(JobStatus::Running)
            .bind(JobStatus::Queued)
            .fetch_optional(pool)
            .await
    }

    /// Fetch a job by ID.
    pub async fn get(pool: &PgPool, id: DbId) -> Result<Option<GenerationJob>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM generation_jobs WHERE id = $1");
        sqlx::query_as::<_, GenerationJob>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All jobs in a given status, oldest first.
    pub async fn list_by_status(
        pool: &PgPool,
        status: JobStatus,
    ) -> Result<Vec<GenerationJob>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM generation_jobs WHERE status = $1 ORDER BY id ASC");
        sqlx::query_as::<_, GenerationJob>(&query)
            .bind(status)
            .fetch_all(pool)
            .await
    }

    /// Send a job back to the queue after an unresumable crash.
    ///
    /// Clears the dispatch bindings so the next attempt starts clean.
    pub async fn requeue(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status = $2, task_id = NULL, account_id = NULL, progress = NULL, \
                 last_event = 'requeued', updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Queued)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Bind the job to the credential backing its run.
    pub async fn set_account(pool: &PgPool, id: DbId, account_id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs SET account_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(account_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record the upstream task identifier once submission succeeded.
    pub async fn set_task_id(pool: &PgPool, id: DbId, task_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE generation_jobs SET task_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Record the most recent protocol event name.
    pub async fn set_last_event(pool: &PgPool, id: DbId, event: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE generation_jobs SET last_event = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(event)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Update the completion fraction (`0.0..=1.0`).
    pub async fn update_progress(pool: &PgPool, id: DbId, progress: f64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE generation_jobs SET progress = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(progress)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Forget a dead front-end message handle so later steps skip it.
    pub async fn clear_notify_handle(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs SET notify_handle = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Terminal success: record the result URL, clear the input image.
    pub async fn complete(
        pool: &PgPool,
        id: DbId,
        result_url: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status = $2, result_url = $3, progress = 1.0, image = NULL, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Completed)
        .bind(result_url)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Terminal failure: record the message, clear the input image.
    pub async fn fail(pool: &PgPool, id: DbId, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status = $2, error_message = $3, image = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Failed)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }
}
