use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::receipt::{Item, ItemRow, NewReceipt, Receipt, ReceiptRow};
use crate::store::{ReceiptStore, StoreError};

const RECEIPT_COLUMNS: &str = "id, file_ref, file_size, content_hash, merchant_name, \
     purchase_date, currency, receipt_category, tax_format, has_total_tax_only, subtotal, \
     tax_amount, tax_percentage, total, total_confidence_score, processing_status, \
     created_at, updated_at";

const ITEM_COLUMNS: &str = "sequence, name, quantity, unit_price, base_price, \
     discount_amount, discount_percentage, tax_price, tax_percentage, total_price, item_type, \
     confidence_score, item_metadata";

#[derive(Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn create_receipt(&self, new: &NewReceipt) -> Result<Receipt, StoreError> {
        let result = sqlx::query_as::<_, ReceiptRow>(&format!(
            "INSERT INTO receipts (id, file_ref, file_size, content_hash) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {RECEIPT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.file_ref)
        .bind(new.file_size)
        .bind(&new.content_hash)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(Receipt::try_from(row)?),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => {
                Err(StoreError::DuplicateHash(new.content_hash.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Receipt>, StoreError> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE content_hash = $1"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Receipt::try_from).transpose()?)
    }

    async fn get_receipt(&self, id: Uuid) -> Result<Option<Receipt>, StoreError> {
        let row = sqlx::query_as::<_, ReceiptRow>(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Receipt::try_from).transpose()?)
    }

    async fn get_items(&self, receipt_id: Uuid) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM receipt_items WHERE receipt_id = $1 ORDER BY sequence ASC"
        ))
        .bind(receipt_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Item::try_from(row).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::receipt::ProcessingStatus;

    async fn connect_db() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = crate::db::create_pool(&url).await.ok()?;
        crate::db::run_migrations(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn test_create_and_find_receipt() {
        let Some(pool) = connect_db().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let store = PgReceiptStore::new(pool);
        let hash = format!("hash-{}", Uuid::new_v4());
        let new = NewReceipt {
            file_ref: "uploads/a.jpg".to_string(),
            file_size: 2048,
            content_hash: hash.clone(),
        };

        let created = store.create_receipt(&new).await.unwrap();
        assert_eq!(created.processing_status, ProcessingStatus::Pending);
        assert!(created.total.is_none());

        let found = store.find_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(store.get_items(created.id).await.unwrap().is_empty());

        let err = store.create_receipt(&new).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateHash(_)));
    }
}
