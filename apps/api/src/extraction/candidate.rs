use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

/// Receipt-level fields as reported by the model, before reconciliation.
/// Enumerated fields stay raw strings; the engine classifies them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidateReceipt {
    pub merchant_name: Option<String>,
    pub purchase_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub receipt_category: Option<String>,
    pub tax_format: Option<String>,
    pub has_total_tax_only: Option<bool>,
    pub subtotal: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total: Option<Decimal>,
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidateItem {
    pub name: String,
    pub quantity: Option<Decimal>,
    pub quantity_format: Option<String>,
    pub is_weight_based: bool,
    pub weight_unit: Option<String>,
    pub unit_price: Option<Decimal>,
    pub base_price: Option<Decimal>,
    pub discount_amount: Option<Decimal>,
    pub discount_percentage: Option<Decimal>,
    pub tax_price: Option<Decimal>,
    pub tax_percentage: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub item_type: Option<String>,
    pub confidence_score: Option<f64>,
    pub is_voided: bool,
    pub original_text: Option<String>,
}

impl CandidateItem {
    /// True when at least one price field survived coercion.
    pub fn has_any_price(&self) -> bool {
        self.unit_price.is_some() || self.base_price.is_some() || self.total_price.is_some()
    }
}

/// Parsed-but-unvalidated output of a single VLM call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidateExtraction {
    pub receipt: CandidateReceipt,
    pub items: Vec<CandidateItem>,
    /// Optional fields that were present but unusable and dropped to null.
    pub warnings: Vec<String>,
}
