use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use super::UnknownVariant;

/// Default priority assigned by upload intake. Lower numbers are claimed first.
pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant::new("job status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Pending jobs are not claimable before this instant (retry backoff).
    pub next_attempt_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub model_used: Option<String>,
    pub extraction_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// One-based number of the attempt currently running (or about to run).
    pub fn attempt(&self) -> i32 {
        self.retry_count + 1
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub status: String,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub model_used: Option<String>,
    pub extraction_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ProcessingJob {
    type Error = UnknownVariant;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ProcessingJob {
            id: row.id,
            receipt_id: row.receipt_id,
            status: row.status.parse()?,
            priority: row.priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_attempt_at: row.next_attempt_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            processing_duration_ms: row.processing_duration_ms,
            worker_id: row.worker_id,
            error_message: row.error_message,
            model_used: row.model_used,
            extraction_metadata: row.extraction_metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
