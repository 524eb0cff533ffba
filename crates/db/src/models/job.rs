//! Generation job entity and DTOs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use vidpool_core::types::{DbId, Timestamp};

/// Job lifecycle status. Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Requested output resolution tier, passed through to the upstream
/// creation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "video_size", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VideoSize {
    Small,
    Large,
}

impl VideoSize {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoSize::Small => "small",
            VideoSize::Large => "large",
        }
    }
}

/// Requested framing. Absent when an input image implies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "orientation", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

/// A row from the `generation_jobs` table.
///
/// `account_id` is set iff the job has ever been dispatched to a
/// worker; `task_id` is set iff the upstream creation call succeeded.
/// Both together are what makes a `running` job resumable after a
/// restart.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationJob {
    pub id: DbId,
    pub user_id: DbId,
    pub chat_id: DbId,
    pub prompt: String,
    pub orientation: Option<Orientation>,
    pub frames: i32,
    pub size: VideoSize,
    /// Optional input image; cleared on terminal transition.
    #[serde(skip_serializing)]
    pub image: Option<Vec<u8>>,
    pub status: JobStatus,
    /// Completion fraction in `0.0..=1.0`.
    pub progress: Option<f64>,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    /// Opaque front-end message identifier for progress edits.
    pub notify_handle: Option<i64>,
    /// Upstream task identifier, assigned once submission succeeds.
    pub task_id: Option<String>,
    pub account_id: Option<DbId>,
    pub poll_interval_secs: f64,
    pub timeout_secs: f64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Name of the most recent protocol event applied to this job.
    pub last_event: Option<String>,
}

impl GenerationJob {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.0))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

/// DTO for enqueueing a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: DbId,
    pub chat_id: DbId,
    pub prompt: String,
    pub orientation: Option<Orientation>,
    pub frames: i32,
    pub size: VideoSize,
    pub image: Option<Vec<u8>>,
    pub notify_handle: Option<i64>,
    pub poll_interval_secs: f64,
    pub timeout_secs: f64,
}
