pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::receipt::{Item, NewReceipt, Receipt};
use crate::models::UnknownVariant;

pub use postgres::PgReceiptStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a receipt with content hash {0} already exists")]
    DuplicateHash(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt receipt row: {0}")]
    Corrupt(#[from] UnknownVariant),
}

/// Receipt persistence. Extraction results are written by the job queue on
/// completion; this trait covers intake and reads.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Inserts a `pending` receipt with no extracted fields.
    async fn create_receipt(&self, new: &NewReceipt) -> Result<Receipt, StoreError>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Receipt>, StoreError>;

    async fn get_receipt(&self, id: Uuid) -> Result<Option<Receipt>, StoreError>;

    /// Items ordered by sequence.
    async fn get_items(&self, receipt_id: Uuid) -> Result<Vec<Item>, StoreError>;
}
