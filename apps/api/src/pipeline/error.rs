use thiserror::Error;
use uuid::Uuid;

use crate::extraction::ParseError;
use crate::queue::QueueError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;
use crate::vlm::VlmError;

/// Everything that can end a processing attempt, classified for the retry policy.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("VLM unavailable: {0}")]
    Unavailable(String),

    #[error("VLM model error: {0}")]
    Model(String),

    #[error("malformed VLM output: {0}")]
    MalformedOutput(#[from] ParseError),

    #[error("extraction failed validation: {0}")]
    Validation(#[from] ReconcileError),

    #[error("receipt {0} does not exist")]
    ReceiptMissing(Uuid),

    #[error("receipt image '{0}' does not exist")]
    ImageMissing(String),

    #[error("persistence error: {0}")]
    Store(String),

    #[error("retries exhausted after {attempts} attempts")]
    ExhaustedRetries { attempts: i32 },
}

impl ProcessingError {
    /// Retryable errors go through `fail`; the rest bypass retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProcessingError::ReceiptMissing(_)
                | ProcessingError::ImageMissing(_)
                | ProcessingError::ExhaustedRetries { .. }
        )
    }
}

impl From<VlmError> for ProcessingError {
    fn from(err: VlmError) -> Self {
        match err {
            VlmError::Unavailable(msg) => ProcessingError::Unavailable(msg),
            VlmError::Model { status, message } => {
                ProcessingError::Model(format!("status {status}: {message}"))
            }
            VlmError::ImageMissing(image_ref) => ProcessingError::ImageMissing(image_ref),
        }
    }
}

impl From<StoreError> for ProcessingError {
    fn from(err: StoreError) -> Self {
        ProcessingError::Store(err.to_string())
    }
}

impl From<QueueError> for ProcessingError {
    fn from(err: QueueError) -> Self {
        ProcessingError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_errors_are_fatal() {
        assert!(!ProcessingError::ReceiptMissing(Uuid::new_v4()).is_retryable());
        assert!(!ProcessingError::from(VlmError::ImageMissing("a.jpg".into())).is_retryable());
        assert!(!ProcessingError::ExhaustedRetries { attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ProcessingError::from(VlmError::Unavailable("refused".into())).is_retryable());
        assert!(ProcessingError::from(VlmError::Model {
            status: 500,
            message: "oom".into()
        })
        .is_retryable());
        assert!(ProcessingError::from(ParseError::NoJson).is_retryable());
        assert!(ProcessingError::from(ReconcileError::NoItems).is_retryable());
    }
}
