use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::UnknownVariant;

// ────────────────────────────────────────────────────────────────────────────
// Enumerations (stored as CHECK-constrained TEXT)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptCategory {
    Grocery,
    Restaurant,
    Retail,
    Service,
    #[default]
    Unknown,
}

impl ReceiptCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptCategory::Grocery => "grocery",
            ReceiptCategory::Restaurant => "restaurant",
            ReceiptCategory::Retail => "retail",
            ReceiptCategory::Service => "service",
            ReceiptCategory::Unknown => "unknown",
        }
    }
}

impl FromStr for ReceiptCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grocery" => Ok(ReceiptCategory::Grocery),
            "restaurant" => Ok(ReceiptCategory::Restaurant),
            "retail" => Ok(ReceiptCategory::Retail),
            "service" => Ok(ReceiptCategory::Service),
            "unknown" => Ok(ReceiptCategory::Unknown),
            other => Err(UnknownVariant::new("receipt_category", other)),
        }
    }
}

/// How tax is presented on the printed receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxFormat {
    /// Tax is added on top of the listed prices.
    Added,
    /// Listed prices already include tax.
    Inclusive,
    #[default]
    None,
}

impl TaxFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxFormat::Added => "added",
            TaxFormat::Inclusive => "inclusive",
            TaxFormat::None => "none",
        }
    }
}

impl FromStr for TaxFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(TaxFormat::Added),
            "inclusive" => Ok(TaxFormat::Inclusive),
            "none" => Ok(TaxFormat::None),
            other => Err(UnknownVariant::new("tax_format", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(UnknownVariant::new("processing_status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Standard,
    ServiceCharge,
    Tip,
    Discount,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Standard => "standard",
            ItemType::ServiceCharge => "service_charge",
            ItemType::Tip => "tip",
            ItemType::Discount => "discount",
        }
    }

    /// Service charges and tips may be printed without a base/tax breakdown.
    pub fn exempt_from_tax_check(&self) -> bool {
        matches!(self, ItemType::ServiceCharge | ItemType::Tip)
    }
}

impl FromStr for ItemType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ItemType::Standard),
            "service_charge" => Ok(ItemType::ServiceCharge),
            "tip" => Ok(ItemType::Tip),
            "discount" => Ok(ItemType::Discount),
            other => Err(UnknownVariant::new("item_type", other)),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Domain records
// ────────────────────────────────────────────────────────────────────────────

/// Diagnostic passthrough stored in `receipt_items.item_metadata`.
/// Downstream consumers read these fields as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemMetadata {
    pub quantity_format: Option<String>,
    pub is_weight_based: bool,
    pub weight_unit: Option<String>,
    pub is_voided: bool,
    pub original_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub sequence: i32,
    pub name: String,
    pub quantity: Decimal,
    pub unit_price: Option<Decimal>,
    pub base_price: Decimal,
    pub discount_amount: Option<Decimal>,
    pub discount_percentage: Option<Decimal>,
    pub tax_price: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total_price: Decimal,
    pub item_type: ItemType,
    pub confidence_score: f64,
    pub item_metadata: ItemMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: Uuid,
    pub file_ref: String,
    pub file_size: i64,
    pub content_hash: String,
    pub merchant_name: Option<String>,
    pub purchase_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub receipt_category: ReceiptCategory,
    pub tax_format: TaxFormat,
    pub has_total_tax_only: bool,
    pub subtotal: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total: Option<Decimal>,
    pub total_confidence_score: Option<f64>,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Receipt-level fields written by the validation engine on job completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiptFields {
    pub merchant_name: Option<String>,
    pub purchase_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub receipt_category: ReceiptCategory,
    pub tax_format: TaxFormat,
    pub has_total_tax_only: bool,
    pub subtotal: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total: Option<Decimal>,
}

/// Input from upload intake.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReceipt {
    pub file_ref: String,
    pub file_size: i64,
    pub content_hash: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Row mappings
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct ReceiptRow {
    pub id: Uuid,
    pub file_ref: String,
    pub file_size: i64,
    pub content_hash: String,
    pub merchant_name: Option<String>,
    pub purchase_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub receipt_category: String,
    pub tax_format: String,
    pub has_total_tax_only: bool,
    pub subtotal: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total: Option<Decimal>,
    pub total_confidence_score: Option<f64>,
    pub processing_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = UnknownVariant;

    fn try_from(row: ReceiptRow) -> Result<Self, Self::Error> {
        Ok(Receipt {
            id: row.id,
            file_ref: row.file_ref,
            file_size: row.file_size,
            content_hash: row.content_hash,
            merchant_name: row.merchant_name,
            purchase_date: row.purchase_date,
            currency: row.currency,
            receipt_category: row.receipt_category.parse()?,
            tax_format: row.tax_format.parse()?,
            has_total_tax_only: row.has_total_tax_only,
            subtotal: row.subtotal,
            tax_amount: row.tax_amount,
            tax_percentage: row.tax_percentage,
            total: row.total,
            total_confidence_score: row.total_confidence_score,
            processing_status: row.processing_status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ItemRow {
    pub sequence: i32,
    pub name: String,
    pub quantity: Decimal,
    pub unit_price: Option<Decimal>,
    pub base_price: Decimal,
    pub discount_amount: Option<Decimal>,
    pub discount_percentage: Option<Decimal>,
    pub tax_price: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total_price: Decimal,
    pub item_type: String,
    pub confidence_score: f64,
    pub item_metadata: Json<ItemMetadata>,
}

impl TryFrom<ItemRow> for Item {
    type Error = UnknownVariant;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(Item {
            sequence: row.sequence,
            name: row.name,
            quantity: row.quantity,
            unit_price: row.unit_price,
            base_price: row.base_price,
            discount_amount: row.discount_amount,
            discount_percentage: row.discount_percentage,
            tax_price: row.tax_price,
            tax_percentage: row.tax_percentage,
            total_price: row.total_price,
            item_type: row.item_type.parse()?,
            confidence_score: row.confidence_score,
            item_metadata: row.item_metadata.0,
        })
    }
}
