//! Durable processing-job queue.
//!
//! Jobs are rows; claiming is a conditional update on `status`, never a shared
//! in-process variable. Every transition also mirrors the owning receipt's
//! `processing_status` inside the same transaction.

pub mod backoff;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::job::ProcessingJob;
use crate::models::UnknownVariant;
use crate::reconcile::ReconciledReceipt;

pub use backoff::RetryPolicy;
pub use postgres::PgJobQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("receipt {0} already has an active job")]
    DuplicateJob(Uuid),

    #[error("receipt {0} not found")]
    ReceiptNotFound(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job row: {0}")]
    Corrupt(#[from] UnknownVariant),
}

/// Everything written when a job succeeds: the reconciled receipt and the
/// job's own bookkeeping.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub extraction: ReconciledReceipt,
    pub model_used: String,
    pub duration_ms: i64,
    pub metadata: Value,
}

/// Result of routing a failure through the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Back to `pending`; claimable again at `next_attempt_at`.
    Retrying {
        attempt: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// `retry_count` reached `max_retries`; the job is terminally `failed`.
    Exhausted { attempts: i32 },
    /// Structural error; `failed` without consuming retries.
    Failed,
    /// The job was not `processing` (already terminal or reclaimed); nothing changed.
    Ignored,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Creates a `pending` job for the receipt.
    /// Fails with `DuplicateJob` when a pending or processing job already exists.
    async fn enqueue(&self, receipt_id: Uuid, priority: i32) -> Result<Uuid, QueueError>;

    /// Atomically claims the due `pending` job with the lowest priority number
    /// (oldest first). Returns `None` when nothing is due or `max_concurrent`
    /// jobs are already processing.
    async fn claim_next(
        &self,
        worker_id: &str,
        max_concurrent: i64,
    ) -> Result<Option<ProcessingJob>, QueueError>;

    /// Marks the job completed and writes the receipt fields and items in one
    /// transaction. Returns `false` (no-op) if the job is no longer processing.
    async fn complete(&self, job_id: Uuid, completion: &JobCompletion) -> Result<bool, QueueError>;

    /// Counts an attempt and either schedules a retry or fails terminally.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError>;

    /// Fails a claimed job terminally without consuming retries.
    async fn fail_permanently(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError>;

    /// Routes every job processing for longer than `older_than` through `fail`.
    async fn reclaim_stale(
        &self,
        older_than: Duration,
    ) -> Result<Vec<(Uuid, FailOutcome)>, QueueError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, QueueError>;

    /// Job history for a receipt, newest first.
    async fn jobs_for_receipt(&self, receipt_id: Uuid) -> Result<Vec<ProcessingJob>, QueueError>;
}

pub(crate) const STALE_LEASE_MESSAGE: &str = "worker lease expired";

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::MemoryStore;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_hand_out_a_job_once() {
        let store = Arc::new(MemoryStore::without_backoff());
        let receipt = store.seed_receipt("uploads/single.jpg").await;
        store.enqueue(receipt.id, 100).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.spawn(async move { store.claim_next(&format!("w{worker}"), 8).await });
        }

        let mut claimed = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap().unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
