//! In-memory stand-ins for the Postgres store, the job queue and the VLM,
//! used by pipeline, scheduler and router tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::job::{JobStatus, ProcessingJob};
use crate::models::receipt::{
    Item, NewReceipt, ProcessingStatus, Receipt, ReceiptCategory, TaxFormat,
};
use crate::queue::{
    FailOutcome, JobCompletion, JobQueue, QueueError, RetryPolicy, STALE_LEASE_MESSAGE,
};
use crate::store::{ReceiptStore, StoreError};
use crate::vlm::{PromptVersion, VlmError, VlmGateway, VlmOutput};

#[derive(Default)]
struct Inner {
    receipts: HashMap<Uuid, Receipt>,
    items: HashMap<Uuid, Vec<Item>>,
    jobs: Vec<ProcessingJob>,
    receipt_writes: usize,
}

impl Inner {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut ProcessingJob, QueueError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(QueueError::JobNotFound(job_id))
    }

    fn set_receipt_status(&mut self, receipt_id: Uuid, status: ProcessingStatus) {
        if let Some(receipt) = self.receipts.get_mut(&receipt_id) {
            receipt.processing_status = status;
            receipt.updated_at = Utc::now();
        }
    }
}

/// One object implementing both `ReceiptStore` and `JobQueue`, mirroring the
/// Postgres implementations' transaction semantics under a single lock.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
}

impl MemoryStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retry,
        }
    }

    /// Retries become due immediately.
    pub fn without_backoff() -> Self {
        Self::new(
            RetryPolicy {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                ..Default::default()
            }
            .with_jitter(0.0),
        )
    }

    pub async fn seed_receipt(&self, file_ref: &str) -> Receipt {
        self.create_receipt(&NewReceipt {
            file_ref: file_ref.to_string(),
            file_size: 1024,
            content_hash: Uuid::new_v4().to_string(),
        })
        .await
        .unwrap()
    }

    /// Number of completed extraction writes applied to receipts.
    pub fn receipt_writes(&self) -> usize {
        self.inner.lock().unwrap().receipt_writes
    }

    pub fn remove_receipt(&self, receipt_id: Uuid) {
        self.inner.lock().unwrap().receipts.remove(&receipt_id);
    }

    pub fn backdate_start(&self, job_id: Uuid, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.job_mut(job_id).unwrap();
        job.started_at = job
            .started_at
            .map(|t| t - chrono::Duration::from_std(by).unwrap());
    }
}

#[async_trait]
impl ReceiptStore for MemoryStore {
    async fn create_receipt(&self, new: &NewReceipt) -> Result<Receipt, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .receipts
            .values()
            .any(|r| r.content_hash == new.content_hash)
        {
            return Err(StoreError::DuplicateHash(new.content_hash.clone()));
        }
        let now = Utc::now();
        let receipt = Receipt {
            id: Uuid::new_v4(),
            file_ref: new.file_ref.clone(),
            file_size: new.file_size,
            content_hash: new.content_hash.clone(),
            merchant_name: None,
            purchase_date: None,
            currency: None,
            receipt_category: ReceiptCategory::Unknown,
            tax_format: TaxFormat::None,
            has_total_tax_only: false,
            subtotal: None,
            tax_amount: None,
            tax_percentage: None,
            total: None,
            total_confidence_score: None,
            processing_status: ProcessingStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        inner.receipts.insert(receipt.id, receipt.clone());
        Ok(receipt)
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Receipt>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .receipts
            .values()
            .find(|r| r.content_hash == content_hash)
            .cloned())
    }

    async fn get_receipt(&self, id: Uuid) -> Result<Option<Receipt>, StoreError> {
        Ok(self.inner.lock().unwrap().receipts.get(&id).cloned())
    }

    async fn get_items(&self, receipt_id: Uuid) -> Result<Vec<Item>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.items.get(&receipt_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, receipt_id: Uuid, priority: i32) -> Result<Uuid, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.receipts.contains_key(&receipt_id) {
            return Err(QueueError::ReceiptNotFound(receipt_id));
        }
        if inner
            .jobs
            .iter()
            .any(|j| j.receipt_id == receipt_id && !j.status.is_terminal())
        {
            return Err(QueueError::DuplicateJob(receipt_id));
        }
        let now = Utc::now();
        let job = ProcessingJob {
            id: Uuid::new_v4(),
            receipt_id,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries: self.retry.max_retries,
            next_attempt_at: now,
            started_at: None,
            completed_at: None,
            processing_duration_ms: None,
            worker_id: None,
            error_message: None,
            model_used: None,
            extraction_metadata: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        inner.jobs.push(job);
        inner.set_receipt_status(receipt_id, ProcessingStatus::Pending);
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        max_concurrent: i64,
    ) -> Result<Option<ProcessingJob>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let in_flight = inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Processing)
            .count() as i64;
        if in_flight >= max_concurrent {
            return Ok(None);
        }

        let now = Utc::now();
        let next = inner
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Pending && j.next_attempt_at <= now)
            .min_by_key(|(idx, j)| (j.priority, j.created_at, *idx))
            .map(|(idx, _)| idx);
        let Some(idx) = next else {
            return Ok(None);
        };

        let job = &mut inner.jobs[idx];
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.updated_at = now;
        let claimed = job.clone();

        inner.items.remove(&claimed.receipt_id);
        inner.set_receipt_status(claimed.receipt_id, ProcessingStatus::Processing);
        Ok(Some(claimed))
    }

    async fn complete(&self, job_id: Uuid, completion: &JobCompletion) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.job_mut(job_id)?;
        if job.status != JobStatus::Processing {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.processing_duration_ms = Some(completion.duration_ms);
        job.model_used = Some(completion.model_used.clone());
        job.extraction_metadata = Some(completion.metadata.clone());
        job.error_message = None;
        job.updated_at = now;
        let receipt_id = job.receipt_id;

        let extraction = &completion.extraction;
        if let Some(receipt) = inner.receipts.get_mut(&receipt_id) {
            let f = &extraction.fields;
            receipt.merchant_name = f.merchant_name.clone();
            receipt.purchase_date = f.purchase_date;
            receipt.currency = f.currency.clone();
            receipt.receipt_category = f.receipt_category;
            receipt.tax_format = f.tax_format;
            receipt.has_total_tax_only = f.has_total_tax_only;
            receipt.subtotal = f.subtotal;
            receipt.tax_amount = f.tax_amount;
            receipt.tax_percentage = f.tax_percentage;
            receipt.total = f.total;
            receipt.total_confidence_score = Some(extraction.total_confidence_score);
            receipt.processing_status = ProcessingStatus::Completed;
            receipt.updated_at = now;
        }
        inner.items.insert(receipt_id, extraction.items.clone());
        inner.receipt_writes += 1;
        Ok(true)
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let backoff = &self.retry;
        let job = inner.job_mut(job_id)?;
        if job.status != JobStatus::Processing {
            return Ok(FailOutcome::Ignored);
        }
        let now = Utc::now();
        let attempts = job.retry_count + 1;
        job.retry_count = attempts;
        job.error_message = Some(error.to_string());
        job.updated_at = now;
        let receipt_id = job.receipt_id;

        if attempts < job.max_retries {
            let next_attempt_at = now + backoff.backoff(attempts);
            job.status = JobStatus::Pending;
            job.next_attempt_at = next_attempt_at;
            job.worker_id = None;
            inner.set_receipt_status(receipt_id, ProcessingStatus::Pending);
            Ok(FailOutcome::Retrying {
                attempt: attempts,
                next_attempt_at,
            })
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            inner.set_receipt_status(receipt_id, ProcessingStatus::Failed);
            Ok(FailOutcome::Exhausted { attempts })
        }
    }

    async fn fail_permanently(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.job_mut(job_id)?;
        if job.status != JobStatus::Processing {
            return Ok(FailOutcome::Ignored);
        }
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.completed_at = Some(now);
        job.error_message = Some(error.to_string());
        job.updated_at = now;
        let receipt_id = job.receipt_id;
        inner.set_receipt_status(receipt_id, ProcessingStatus::Failed);
        Ok(FailOutcome::Failed)
    }

    async fn reclaim_stale(
        &self,
        older_than: Duration,
    ) -> Result<Vec<(Uuid, FailOutcome)>, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap();
        let stale: Vec<Uuid> = self
            .inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Processing && j.started_at.is_some_and(|t| t < cutoff)
            })
            .map(|j| j.id)
            .collect();

        let mut reclaimed = Vec::new();
        for job_id in stale {
            reclaimed.push((job_id, self.fail(job_id, STALE_LEASE_MESSAGE).await?));
        }
        Ok(reclaimed)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn jobs_for_receipt(&self, receipt_id: Uuid) -> Result<Vec<ProcessingJob>, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .rev()
            .filter(|j| j.receipt_id == receipt_id)
            .cloned()
            .collect())
    }
}

/// Scripted VLM: replays queued responses in order, then repeats the last one.
pub struct ScriptedGateway {
    responses: Mutex<VecDeque<Result<String, VlmError>>>,
    last: Mutex<Option<String>>,
    delay: Option<Duration>,
    calls: Mutex<usize>,
}

impl ScriptedGateway {
    pub fn new(responses: Vec<Result<String, VlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            delay: None,
            calls: Mutex::new(0),
        }
    }

    pub fn always(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl VlmGateway for ScriptedGateway {
    async fn extract(
        &self,
        _image_ref: &str,
        prompt_version: PromptVersion,
    ) -> Result<VlmOutput, VlmError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        let text = match next {
            Some(Ok(text)) => {
                *self.last.lock().unwrap() = Some(text.clone());
                text
            }
            Some(Err(err)) => return Err(err),
            None => match self.last.lock().unwrap().clone() {
                Some(text) => text,
                None => return Err(VlmError::Unavailable("script exhausted".to_string())),
            },
        };
        Ok(VlmOutput {
            text,
            model: "scripted".to_string(),
            prompt_version,
            eval_count: None,
        })
    }
}
