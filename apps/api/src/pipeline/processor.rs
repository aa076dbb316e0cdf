use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{error, info, info_span, warn, Instrument};

use crate::extraction::parse;
use crate::models::job::ProcessingJob;
use crate::pipeline::ProcessingError;
use crate::queue::{FailOutcome, JobCompletion, JobQueue};
use crate::reconcile::{reconcile, ReconciledReceipt, Tolerances};
use crate::store::ReceiptStore;
use crate::vlm::{PromptVersion, VlmGateway, VlmOutput};

/// Raw output is truncated to this many characters in failure logs.
const RAW_OUTPUT_LOG_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// `complete` was a no-op: the job had already left `processing`.
    AlreadyFinished,
    Failed(FailOutcome),
    /// The failure could not be written; the stale sweep will reclaim the job.
    Unrecorded,
}

/// Runs one claimed job through gateway, parser and validation, then records
/// the result. Never returns an error: every failure is routed to the queue.
pub struct JobProcessor {
    receipts: Arc<dyn ReceiptStore>,
    queue: Arc<dyn JobQueue>,
    gateway: Arc<dyn VlmGateway>,
    tolerances: Tolerances,
    prompt_version: PromptVersion,
    vlm_timeout: Duration,
}

impl JobProcessor {
    pub fn new(
        receipts: Arc<dyn ReceiptStore>,
        queue: Arc<dyn JobQueue>,
        gateway: Arc<dyn VlmGateway>,
        tolerances: Tolerances,
        prompt_version: PromptVersion,
        vlm_timeout: Duration,
    ) -> Self {
        Self {
            receipts,
            queue,
            gateway,
            tolerances,
            prompt_version,
            vlm_timeout,
        }
    }

    pub async fn process(&self, job: &ProcessingJob, worker_id: &str) -> JobOutcome {
        let span = info_span!(
            "job",
            job_id = %job.id,
            receipt_id = %job.receipt_id,
            attempt = job.attempt(),
            worker_id,
        );

        async move {
            let started = Instant::now();
            let mut raw_output = None;
            match self.run(job, started, &mut raw_output).await {
                Ok(true) => {
                    info!(duration_ms = started.elapsed().as_millis() as u64, "Job completed");
                    JobOutcome::Completed
                }
                Ok(false) => {
                    warn!("Job already finished; completion skipped");
                    JobOutcome::AlreadyFinished
                }
                Err(err) => self.record_failure(job, err, raw_output.as_deref()).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        job: &ProcessingJob,
        started: Instant,
        raw_output: &mut Option<String>,
    ) -> Result<bool, ProcessingError> {
        let receipt = self
            .receipts
            .get_receipt(job.receipt_id)
            .await?
            .ok_or(ProcessingError::ReceiptMissing(job.receipt_id))?;

        let output = tokio::time::timeout(
            self.vlm_timeout,
            self.gateway.extract(&receipt.file_ref, self.prompt_version),
        )
        .await
        .map_err(|_| {
            ProcessingError::Unavailable(format!(
                "VLM call exceeded {}s timeout",
                self.vlm_timeout.as_secs()
            ))
        })??;
        *raw_output = Some(output.text.clone());

        let candidate = parse(&output.text)?;
        let extraction = reconcile(&candidate, &self.tolerances)?;

        if !extraction.report.flags.is_empty() || extraction.report.total_mismatch {
            info!(
                flags = extraction.report.flags.len(),
                total_mismatch = extraction.report.total_mismatch,
                confidence = extraction.total_confidence_score,
                "Extraction reconciled with penalties"
            );
        }

        let completion = JobCompletion {
            metadata: extraction_metadata(&output, &extraction),
            model_used: output.model,
            duration_ms: started.elapsed().as_millis() as i64,
            extraction,
        };
        Ok(self.queue.complete(job.id, &completion).await?)
    }

    async fn record_failure(
        &self,
        job: &ProcessingJob,
        err: ProcessingError,
        raw_output: Option<&str>,
    ) -> JobOutcome {
        let message = err.to_string();
        let recorded = if err.is_retryable() {
            self.queue.fail(job.id, &message).await
        } else {
            self.queue.fail_permanently(job.id, &message).await
        };

        let outcome = match recorded {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %message, record_error = %e, "Could not record job failure");
                return JobOutcome::Unrecorded;
            }
        };

        let raw = truncate_chars(raw_output.unwrap_or(""), RAW_OUTPUT_LOG_CHARS);
        match outcome {
            FailOutcome::Retrying {
                attempt,
                next_attempt_at,
            } => {
                warn!(error = %message, attempt, %next_attempt_at, "Job failed; retry scheduled");
            }
            FailOutcome::Exhausted { attempts } => {
                let terminal = ProcessingError::ExhaustedRetries { attempts };
                error!(error = %message, raw_output = %raw, "{terminal}");
            }
            FailOutcome::Failed => {
                error!(error = %message, raw_output = %raw, "Job failed permanently");
            }
            FailOutcome::Ignored => {
                warn!(error = %message, "Failure not recorded; job no longer processing");
            }
        }
        JobOutcome::Failed(outcome)
    }
}

fn extraction_metadata(output: &VlmOutput, extraction: &ReconciledReceipt) -> Value {
    json!({
        "prompt_version": output.prompt_version,
        "model": output.model,
        "raw_output_chars": output.text.chars().count(),
        "eval_count": output.eval_count,
        "item_count": extraction.items.len(),
        "total_confidence_score": extraction.total_confidence_score,
        "reconciliation": extraction.report,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}
