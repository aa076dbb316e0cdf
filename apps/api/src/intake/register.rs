use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::job::DEFAULT_PRIORITY;
use crate::models::receipt::{NewReceipt, Receipt};
use crate::queue::JobQueue;
use crate::store::{ReceiptStore, StoreError};

/// Called by the upload collaborator once the file is durably stored.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub file_ref: String,
    pub file_size: i64,
    pub content_hash: String,
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub receipt: Receipt,
    /// `None` when the upload matched an existing receipt.
    pub job_id: Option<Uuid>,
    pub deduplicated: bool,
}

fn validate(req: &RegisterRequest) -> Result<(), AppError> {
    if req.file_ref.trim().is_empty() {
        return Err(AppError::Validation("file_ref must not be empty".to_string()));
    }
    if req.content_hash.trim().is_empty() {
        return Err(AppError::Validation("content_hash must not be empty".to_string()));
    }
    if req.file_size < 0 {
        return Err(AppError::Validation("file_size must not be negative".to_string()));
    }
    Ok(())
}

/// Registers an uploaded receipt and enqueues its extraction job.
/// A repeated content hash returns the existing receipt without a new job.
pub async fn register_receipt(
    receipts: &dyn ReceiptStore,
    queue: &dyn JobQueue,
    req: &RegisterRequest,
) -> Result<RegisterResponse, AppError> {
    validate(req)?;

    if let Some(existing) = receipts.find_by_hash(&req.content_hash).await? {
        info!(receipt_id = %existing.id, "Upload deduplicated by content hash");
        return Ok(RegisterResponse {
            receipt: existing,
            job_id: None,
            deduplicated: true,
        });
    }

    let new = NewReceipt {
        file_ref: req.file_ref.clone(),
        file_size: req.file_size,
        content_hash: req.content_hash.clone(),
    };
    let receipt = match receipts.create_receipt(&new).await {
        Ok(receipt) => receipt,
        // Lost a race with a concurrent upload of the same file.
        Err(StoreError::DuplicateHash(hash)) => {
            let existing = receipts
                .find_by_hash(&hash)
                .await?
                .ok_or_else(|| AppError::Conflict(format!("receipt {hash} vanished")))?;
            return Ok(RegisterResponse {
                receipt: existing,
                job_id: None,
                deduplicated: true,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let job_id = queue
        .enqueue(receipt.id, req.priority.unwrap_or(DEFAULT_PRIORITY))
        .await?;
    info!(receipt_id = %receipt.id, %job_id, "Receipt registered");

    Ok(RegisterResponse {
        receipt,
        job_id: Some(job_id),
        deduplicated: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::testing::MemoryStore;

    fn request(hash: &str) -> RegisterRequest {
        RegisterRequest {
            file_ref: "uploads/2025/receipt.jpg".to_string(),
            file_size: 4096,
            content_hash: hash.to_string(),
            priority: None,
        }
    }

    #[tokio::test]
    async fn test_register_creates_pending_job_with_default_priority() {
        let store = MemoryStore::without_backoff();
        let response = register_receipt(&store, &store, &request("abc")).await.unwrap();

        assert!(!response.deduplicated);
        let job = store.get_job(response.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.receipt_id, response.receipt.id);
    }

    #[tokio::test]
    async fn test_register_deduplicates_by_hash() {
        let store = MemoryStore::without_backoff();
        let first = register_receipt(&store, &store, &request("same")).await.unwrap();
        let second = register_receipt(&store, &store, &request("same")).await.unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.receipt.id, first.receipt.id);
        assert!(second.job_id.is_none());
        assert_eq!(store.jobs_for_receipt(first.receipt.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_file_ref() {
        let store = MemoryStore::without_backoff();
        let mut req = request("x");
        req.file_ref = "  ".to_string();
        let err = register_receipt(&store, &store, &req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
