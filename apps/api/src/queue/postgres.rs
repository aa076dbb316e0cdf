use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::job::{JobRow, ProcessingJob};
use crate::models::receipt::{Item, ProcessingStatus, ReceiptFields};
use crate::queue::{
    FailOutcome, JobCompletion, JobQueue, QueueError, RetryPolicy, STALE_LEASE_MESSAGE,
};

const JOB_COLUMNS: &str = "id, receipt_id, status, priority, retry_count, max_retries, \
     next_attempt_at, started_at, completed_at, processing_duration_ms, worker_id, \
     error_message, model_used, extraction_metadata, created_at, updated_at";

/// Advisory lock key serialising `claim_next` so the in-flight count and the
/// claim happen atomically across worker processes.
const CLAIM_LOCK_KEY: i64 = 0x7265_6365_6970_7473;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transaction helpers
// ────────────────────────────────────────────────────────────────────────────

async fn set_receipt_status(
    tx: &mut Transaction<'_, Postgres>,
    receipt_id: Uuid,
    status: ProcessingStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE receipts SET processing_status = $2, updated_at = NOW() WHERE id = $1")
        .bind(receipt_id)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn write_receipt_fields(
    tx: &mut Transaction<'_, Postgres>,
    receipt_id: Uuid,
    fields: &ReceiptFields,
    confidence: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE receipts SET \
            merchant_name = $2, purchase_date = $3, currency = $4, receipt_category = $5, \
            tax_format = $6, has_total_tax_only = $7, subtotal = $8, tax_amount = $9, \
            tax_percentage = $10, total = $11, total_confidence_score = $12, \
            processing_status = 'completed', updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(receipt_id)
    .bind(&fields.merchant_name)
    .bind(fields.purchase_date)
    .bind(&fields.currency)
    .bind(fields.receipt_category.as_str())
    .bind(fields.tax_format.as_str())
    .bind(fields.has_total_tax_only)
    .bind(fields.subtotal)
    .bind(fields.tax_amount)
    .bind(fields.tax_percentage)
    .bind(fields.total)
    .bind(confidence)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn replace_items(
    tx: &mut Transaction<'_, Postgres>,
    receipt_id: Uuid,
    items: &[Item],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM receipt_items WHERE receipt_id = $1")
        .bind(receipt_id)
        .execute(&mut **tx)
        .await?;

    for item in items {
        sqlx::query(
            "INSERT INTO receipt_items (id, receipt_id, sequence, name, quantity, unit_price, \
                base_price, discount_amount, discount_percentage, tax_price, tax_percentage, \
                total_price, item_type, confidence_score, item_metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(Uuid::new_v4())
        .bind(receipt_id)
        .bind(item.sequence)
        .bind(&item.name)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.base_price)
        .bind(item.discount_amount)
        .bind(item.discount_percentage)
        .bind(item.tax_price)
        .bind(item.tax_percentage)
        .bind(item.total_price)
        .bind(item.item_type.as_str())
        .bind(item.confidence_score)
        .bind(Json(item.item_metadata.clone()))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Locks the job row and returns `(receipt_id, status, retry_count, max_retries)`.
async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
) -> Result<(Uuid, String, i32, i32), QueueError> {
    sqlx::query_as::<_, (Uuid, String, i32, i32)>(
        "SELECT receipt_id, status, retry_count, max_retries \
         FROM processing_jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(QueueError::JobNotFound(job_id))
}

// ────────────────────────────────────────────────────────────────────────────
// JobQueue
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, receipt_id: Uuid, priority: i32) -> Result<Uuid, QueueError> {
        let mut tx = self.pool.begin().await?;
        let job_id = Uuid::new_v4();

        let inserted = sqlx::query(
            "INSERT INTO processing_jobs (id, receipt_id, priority, max_retries) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id)
        .bind(receipt_id)
        .bind(priority)
        .bind(self.retry.max_retries)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                return Err(QueueError::DuplicateJob(receipt_id));
            }
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                return Err(QueueError::ReceiptNotFound(receipt_id));
            }
            Err(e) => return Err(e.into()),
        }

        set_receipt_status(&mut tx, receipt_id, ProcessingStatus::Pending).await?;
        tx.commit().await?;

        info!(%job_id, %receipt_id, priority, "Job enqueued");
        Ok(job_id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        max_concurrent: i64,
    ) -> Result<Option<ProcessingJob>, QueueError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let in_flight: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processing_jobs WHERE status = 'processing'")
                .fetch_one(&mut *tx)
                .await?;
        if in_flight >= max_concurrent {
            tx.commit().await?;
            debug!(in_flight, max_concurrent, "Concurrency budget exhausted");
            return Ok(None);
        }

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE processing_jobs \
             SET status = 'processing', started_at = NOW(), worker_id = $1, updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM processing_jobs \
                 WHERE status = 'pending' AND next_attempt_at <= NOW() \
                 ORDER BY priority ASC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) AND status = 'pending' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        // A reprocessed receipt drops its previous extraction until the new one lands.
        sqlx::query("DELETE FROM receipt_items WHERE receipt_id = $1")
            .bind(row.receipt_id)
            .execute(&mut *tx)
            .await?;
        set_receipt_status(&mut tx, row.receipt_id, ProcessingStatus::Processing).await?;
        tx.commit().await?;

        Ok(Some(ProcessingJob::try_from(row)?))
    }

    async fn complete(&self, job_id: Uuid, completion: &JobCompletion) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await?;

        let receipt_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE processing_jobs \
             SET status = 'completed', completed_at = NOW(), processing_duration_ms = $2, \
                 model_used = $3, extraction_metadata = $4, error_message = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'processing' \
             RETURNING receipt_id",
        )
        .bind(job_id)
        .bind(completion.duration_ms)
        .bind(&completion.model_used)
        .bind(&completion.metadata)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(receipt_id) = receipt_id else {
            tx.rollback().await?;
            return match self.get_job(job_id).await? {
                Some(job) if job.status.is_terminal() => {
                    debug!(%job_id, status = %job.status, "Complete ignored; job already finished");
                    Ok(false)
                }
                Some(job) => {
                    warn!(%job_id, status = %job.status, "Completion discarded; job was reclaimed");
                    Ok(false)
                }
                None => Err(QueueError::JobNotFound(job_id)),
            };
        };

        let extraction = &completion.extraction;
        write_receipt_fields(
            &mut tx,
            receipt_id,
            &extraction.fields,
            extraction.total_confidence_score,
        )
        .await?;
        replace_items(&mut tx, receipt_id, &extraction.items).await?;
        tx.commit().await?;

        Ok(true)
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;
        let (receipt_id, status, retry_count, max_retries) = lock_job(&mut tx, job_id).await?;

        if status != "processing" {
            tx.commit().await?;
            return Ok(FailOutcome::Ignored);
        }

        let attempts = retry_count + 1;
        let outcome = if attempts < max_retries {
            let next_attempt_at = Utc::now() + self.retry.backoff(attempts);
            sqlx::query(
                "UPDATE processing_jobs \
                 SET status = 'pending', retry_count = $2, next_attempt_at = $3, \
                     worker_id = NULL, error_message = $4, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(next_attempt_at)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            set_receipt_status(&mut tx, receipt_id, ProcessingStatus::Pending).await?;
            FailOutcome::Retrying {
                attempt: attempts,
                next_attempt_at,
            }
        } else {
            sqlx::query(
                "UPDATE processing_jobs \
                 SET status = 'failed', retry_count = $2, completed_at = NOW(), \
                     processing_duration_ms = \
                         (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT, \
                     error_message = $3, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            set_receipt_status(&mut tx, receipt_id, ProcessingStatus::Failed).await?;
            FailOutcome::Exhausted { attempts }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn fail_permanently(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;
        let (receipt_id, status, _, _) = lock_job(&mut tx, job_id).await?;

        if status != "processing" {
            tx.commit().await?;
            return Ok(FailOutcome::Ignored);
        }

        sqlx::query(
            "UPDATE processing_jobs \
             SET status = 'failed', completed_at = NOW(), \
                 processing_duration_ms = \
                     (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT, \
                 error_message = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        set_receipt_status(&mut tx, receipt_id, ProcessingStatus::Failed).await?;
        tx.commit().await?;

        Ok(FailOutcome::Failed)
    }

    async fn reclaim_stale(
        &self,
        older_than: Duration,
    ) -> Result<Vec<(Uuid, FailOutcome)>, QueueError> {
        let stale: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM processing_jobs \
             WHERE status = 'processing' \
               AND started_at < NOW() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for job_id in stale {
            let outcome = self.fail(job_id, STALE_LEASE_MESSAGE).await?;
            warn!(%job_id, ?outcome, "Reclaimed stale job");
            reclaimed.push((job_id, outcome));
        }
        Ok(reclaimed)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProcessingJob::try_from).transpose()?)
    }

    async fn jobs_for_receipt(&self, receipt_id: Uuid) -> Result<Vec<ProcessingJob>, QueueError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs \
             WHERE receipt_id = $1 ORDER BY created_at DESC"
        ))
        .bind(receipt_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| ProcessingJob::try_from(row).map_err(QueueError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, OnceLock};

    use serde_json::json;

    use super::*;
    use crate::extraction::parse;
    use crate::models::job::JobStatus;
    use crate::models::receipt::NewReceipt;
    use crate::reconcile::{reconcile, Tolerances};
    use crate::store::{PgReceiptStore, ReceiptStore};

    /// Queue tests share global tables (the in-flight count is global), so
    /// they run one at a time against a truncated database.
    fn db_lock() -> &'static tokio::sync::Mutex<()> {
        static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
    }

    async fn connect_db() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = crate::db::create_pool(&url).await.ok()?;
        crate::db::run_migrations(&pool).await.ok()?;
        sqlx::query("TRUNCATE receipts CASCADE")
            .execute(&pool)
            .await
            .ok()?;
        Some(pool)
    }

    fn no_wait_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        }
        .with_jitter(0.0)
    }

    async fn new_receipt(pool: &PgPool) -> Uuid {
        PgReceiptStore::new(pool.clone())
            .create_receipt(&NewReceipt {
                file_ref: "uploads/r.jpg".to_string(),
                file_size: 10,
                content_hash: Uuid::new_v4().to_string(),
            })
            .await
            .unwrap()
            .id
    }

    fn completion() -> JobCompletion {
        let raw = r#"{"items":[{"item_name":"Coffee","item_quantity":2,"item_unit_price":2.50,"item_total_price":5.00}]}"#;
        JobCompletion {
            extraction: reconcile(&parse(raw).unwrap(), &Tolerances::default()).unwrap(),
            model_used: "test-model".to_string(),
            duration_ms: 42,
            metadata: json!({"prompt_version": "v2"}),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_enqueue_rejects_second_active_job() {
        let _guard = db_lock().lock().await;
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let queue = PgJobQueue::new(pool.clone(), no_wait_policy());
        let receipt_id = new_receipt(&pool).await;

        queue.enqueue(receipt_id, 100).await.unwrap();
        let err = queue.enqueue(receipt_id, 100).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(id) if id == receipt_id));

        let err = queue.enqueue(Uuid::new_v4(), 100).await.unwrap_err();
        assert!(matches!(err, QueueError::ReceiptNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore]
    async fn test_concurrent_claims_take_a_job_once() {
        let _guard = db_lock().lock().await;
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let queue = Arc::new(PgJobQueue::new(pool.clone(), no_wait_policy()));
        let receipt_id = new_receipt(&pool).await;
        let job_id = queue.enqueue(receipt_id, 100).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.claim_next(&format!("worker-{n}"), 10).await.unwrap()
            }));
        }
        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job);
            }
        }

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job_id);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert!(claimed[0].started_at.is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_claim_respects_priority_and_concurrency() {
        let _guard = db_lock().lock().await;
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let queue = PgJobQueue::new(pool.clone(), no_wait_policy());
        let low = queue.enqueue(new_receipt(&pool).await, 200).await.unwrap();
        let high = queue.enqueue(new_receipt(&pool).await, 10).await.unwrap();

        let first = queue.claim_next("w", 1).await.unwrap().unwrap();
        assert_eq!(first.id, high);
        assert!(queue.claim_next("w", 1).await.unwrap().is_none());

        let second = queue.claim_next("w", 2).await.unwrap().unwrap();
        assert_eq!(second.id, low);
    }

    #[tokio::test]
    #[ignore]
    async fn test_three_failures_exhaust_the_job() {
        let _guard = db_lock().lock().await;
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let queue = PgJobQueue::new(pool.clone(), no_wait_policy());
        let receipt_id = new_receipt(&pool).await;
        let job_id = queue.enqueue(receipt_id, 100).await.unwrap();

        for attempt in 1..=3 {
            let job = queue.claim_next("w", 5).await.unwrap().unwrap();
            assert_eq!(job.id, job_id);
            let outcome = queue.fail(job_id, "vlm unavailable").await.unwrap();
            if attempt < 3 {
                assert!(matches!(outcome, FailOutcome::Retrying { attempt: a, .. } if a == attempt));
            } else {
                assert_eq!(outcome, FailOutcome::Exhausted { attempts: 3 });
            }
        }

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error_message.as_deref(), Some("vlm unavailable"));
        assert!(queue.claim_next("w", 5).await.unwrap().is_none());

        let receipt = PgReceiptStore::new(pool).get_receipt(receipt_id).await.unwrap().unwrap();
        assert_eq!(receipt.processing_status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    #[ignore]
    async fn test_complete_writes_receipt_once() {
        let _guard = db_lock().lock().await;
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let queue = PgJobQueue::new(pool.clone(), no_wait_policy());
        let store = PgReceiptStore::new(pool.clone());
        let receipt_id = new_receipt(&pool).await;
        let job_id = queue.enqueue(receipt_id, 100).await.unwrap();
        queue.claim_next("w", 5).await.unwrap().unwrap();

        assert!(queue.complete(job_id, &completion()).await.unwrap());
        let first = store.get_receipt(receipt_id).await.unwrap().unwrap();
        assert_eq!(first.processing_status, ProcessingStatus::Completed);
        assert_eq!(store.get_items(receipt_id).await.unwrap().len(), 1);

        assert!(!queue.complete(job_id, &completion()).await.unwrap());
        let second = store.get_receipt(receipt_id).await.unwrap().unwrap();
        assert_eq!(second.updated_at, first.updated_at);

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.model_used.as_deref(), Some("test-model"));
        assert_eq!(queue.fail(job_id, "late").await.unwrap(), FailOutcome::Ignored);
    }

    #[tokio::test]
    #[ignore]
    async fn test_stale_jobs_are_reclaimed() {
        let _guard = db_lock().lock().await;
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let queue = PgJobQueue::new(pool.clone(), no_wait_policy());
        let job_id = queue.enqueue(new_receipt(&pool).await, 100).await.unwrap();
        queue.claim_next("crashed", 5).await.unwrap().unwrap();
        sqlx::query("UPDATE processing_jobs SET started_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(job_id)
            .execute(&pool)
            .await
            .unwrap();

        let reclaimed = queue.reclaim_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.worker_id.is_none());
    }
}
