use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::extraction::{CandidateExtraction, CandidateItem, CandidateReceipt};
use crate::models::receipt::{Item, ItemMetadata, ItemType, ReceiptCategory, ReceiptFields, TaxFormat};
use crate::reconcile::{ReconcileError, Tolerances};

/// Why an item's confidence was lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    /// `quantity × unit_price` disagrees with the printed base price.
    PriceMismatch,
    /// Base price known but quantity is zero.
    UnitPriceUnderivable,
    /// `base_price + tax_price` disagrees with the printed total.
    TaxMismatch,
    /// Standard item printed without any usable price.
    Unpriced,
    NegativeQuantity,
    /// A printed or derived value too large to store; it was dropped.
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFlag {
    pub sequence: i32,
    pub kind: FlagKind,
    pub detail: String,
}

/// Diagnostics recorded alongside the job's extraction metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    /// `None` when the item sum does not fit a stored amount.
    pub computed_total: Option<Decimal>,
    pub reported_total: Option<Decimal>,
    pub total_mismatch: bool,
    pub mean_item_confidence: f64,
    pub flags: Vec<ItemFlag>,
    /// Sequences of items printed without a quantity (defaulted to 1).
    pub defaulted_quantities: Vec<i32>,
    pub parser_warnings: Vec<String>,
    /// Receipt-level fields dropped because they could not be stored.
    pub dropped_fields: Vec<String>,
}

/// A validated extraction ready to be written in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledReceipt {
    pub fields: ReceiptFields,
    pub items: Vec<Item>,
    pub total_confidence_score: f64,
    pub report: ReconciliationReport,
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn round_unit(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

fn classify_item(raw: Option<&str>) -> ItemType {
    let normalized = raw.map(|s| s.trim().to_lowercase().replace([' ', '-'], "_"));
    match normalized.as_deref() {
        Some("service_charge" | "service" | "service_fee" | "servicecharge" | "fee") => {
            ItemType::ServiceCharge
        }
        Some("tip" | "gratuity") => ItemType::Tip,
        Some("discount" | "coupon" | "promo" | "promotion" | "rebate") => ItemType::Discount,
        _ => ItemType::Standard,
    }
}

fn classify_category(raw: Option<&str>) -> ReceiptCategory {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("grocery" | "groceries" | "supermarket") => ReceiptCategory::Grocery,
        Some("restaurant" | "cafe" | "bar" | "food" | "dining") => ReceiptCategory::Restaurant,
        Some("retail" | "store" | "shop" | "shopping") => ReceiptCategory::Retail,
        Some("service" | "services") => ReceiptCategory::Service,
        _ => ReceiptCategory::Unknown,
    }
}

fn classify_tax_format(raw: Option<&str>) -> TaxFormat {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("added" | "exclusive" | "excluded" | "add_on") => TaxFormat::Added,
        Some("inclusive" | "included" | "incl") => TaxFormat::Inclusive,
        _ => TaxFormat::None,
    }
}

fn resolve_fields(
    receipt: &CandidateReceipt,
    tolerances: &Tolerances,
    dropped: &mut Vec<String>,
) -> ReceiptFields {
    let mut amount = |field: &str, value: Option<Decimal>| {
        let value = value?;
        if tolerances.amount_in_range(value) {
            Some(value)
        } else {
            dropped.push(format!("{field}: {value}"));
            None
        }
    };
    let subtotal = amount("subtotal", receipt.subtotal);
    let tax_amount = amount("tax_amount", receipt.tax_amount);
    let total = amount("total", receipt.total);
    let tax_percentage = match receipt.tax_percentage {
        Some(value) if !tolerances.percentage_in_range(value) => {
            dropped.push(format!("tax_percentage: {value}"));
            None
        }
        value => value,
    };

    ReceiptFields {
        merchant_name: receipt.merchant_name.clone(),
        purchase_date: receipt.purchase_date,
        currency: receipt.currency.clone(),
        receipt_category: classify_category(receipt.receipt_category.as_deref()),
        tax_format: classify_tax_format(receipt.tax_format.as_deref()),
        has_total_tax_only: receipt.has_total_tax_only.unwrap_or(false),
        subtotal,
        tax_amount,
        tax_percentage,
        total,
    }
}

fn quantity_format(candidate: &CandidateItem, quantity: Decimal) -> String {
    if let Some(declared) = &candidate.quantity_format {
        return declared.clone();
    }
    if candidate.is_weight_based {
        "weight"
    } else if candidate.quantity.is_none() {
        "implicit"
    } else if quantity.fract().is_zero() {
        "count"
    } else {
        "decimal"
    }
    .to_string()
}

/// Per-item working state while the pricing chain is resolved.
struct ItemReconciler<'a> {
    sequence: i32,
    tolerances: &'a Tolerances,
    confidence: f64,
    flags: Vec<ItemFlag>,
}

impl ItemReconciler<'_> {
    fn flag(&mut self, kind: FlagKind, cap: f64, detail: String) {
        self.confidence = self.confidence.min(cap);
        self.flags.push(ItemFlag {
            sequence: self.sequence,
            kind,
            detail,
        });
    }

    fn mismatch(&mut self, kind: FlagKind, detail: String) {
        let cap = self.tolerances.mismatch_confidence_cap;
        self.flag(kind, cap, detail);
    }

    /// Drops an amount that cannot be stored, flagging the item.
    fn amount(&mut self, field: &str, value: Option<Decimal>) -> Option<Decimal> {
        let value = value?;
        if self.tolerances.amount_in_range(value) {
            return Some(value);
        }
        self.mismatch(FlagKind::OutOfRange, format!("{field} {value} dropped"));
        None
    }

    fn percentage(&mut self, field: &str, value: Option<Decimal>) -> Option<Decimal> {
        let value = value?;
        if self.tolerances.percentage_in_range(value) {
            return Some(value);
        }
        self.mismatch(FlagKind::OutOfRange, format!("{field} {value} dropped"));
        None
    }
}

fn reconcile_item(
    index: usize,
    candidate: &CandidateItem,
    has_total_tax_only: bool,
    tolerances: &Tolerances,
) -> (Item, Vec<ItemFlag>) {
    let item_type = classify_item(candidate.item_type.as_deref());
    let mut r = ItemReconciler {
        sequence: index as i32 + 1,
        tolerances,
        confidence: candidate
            .confidence_score
            .unwrap_or(tolerances.default_item_confidence)
            .clamp(0.0, 1.0),
        flags: Vec::new(),
    };

    // 1. Quantity, at the precision it is stored with
    let quantity = match r.amount("quantity", candidate.quantity) {
        None => Decimal::ONE,
        Some(q) if q.is_sign_negative() => {
            r.mismatch(
                FlagKind::NegativeQuantity,
                format!("quantity {q} reported as negative"),
            );
            round_unit(q.abs())
        }
        Some(q) => round_unit(q),
    };

    let unit_in = r.amount("unit price", candidate.unit_price);
    let base_in = r.amount("base price", candidate.base_price);
    let tax_in = r.amount("tax price", candidate.tax_price);
    let total_in = r.amount("total price", candidate.total_price);
    let discount_amount = r.amount("discount amount", candidate.discount_amount);
    let discount_percentage = r.percentage("discount percentage", candidate.discount_percentage);
    let tax_percentage = r.percentage("tax percentage", candidate.tax_percentage);

    let forced_tax_free = has_total_tax_only && item_type == ItemType::Standard;
    let tax_for_total = if forced_tax_free { None } else { tax_in };
    // Base price implied by the printed total, when one was printed.
    let printed_base = total_in
        .and_then(|total| total.checked_sub(tax_for_total.unwrap_or(Decimal::ZERO)))
        .filter(|base| tolerances.amount_in_range(*base));

    // 2. Pricing triple (quantity, unit_price, base_price)
    let mut unit_price = unit_in;
    let base_price = match (unit_in, base_in) {
        (Some(unit), Some(base)) => {
            match quantity.checked_mul(unit) {
                Some(expected) if tolerances.prices_agree(expected, base) => {}
                Some(expected) => r.mismatch(
                    FlagKind::PriceMismatch,
                    format!("{quantity} x {unit} = {expected}, printed base {base}"),
                ),
                None => r.mismatch(
                    FlagKind::PriceMismatch,
                    format!("{quantity} x {unit} overflows, printed base {base}"),
                ),
            }
            Some(base)
        }
        (Some(unit), None) => {
            let product = quantity.checked_mul(unit).map(round_money);
            let derived = match product {
                Some(value) => r.amount("derived base price", Some(value)),
                None => {
                    r.mismatch(
                        FlagKind::OutOfRange,
                        format!("{quantity} x {unit} overflows"),
                    );
                    None
                }
            };
            match (derived, printed_base) {
                (Some(derived), Some(printed)) if !tolerances.prices_agree(derived, printed) => {
                    r.mismatch(
                        FlagKind::PriceMismatch,
                        format!("{quantity} x {unit} = {derived}, printed {printed}"),
                    );
                    Some(printed)
                }
                (Some(derived), _) => Some(derived),
                (None, printed) => printed,
            }
        }
        (None, Some(base)) => {
            if quantity.is_zero() {
                r.mismatch(
                    FlagKind::UnitPriceUnderivable,
                    "quantity is zero; unit price left empty".to_string(),
                );
            } else {
                let derived = base.checked_div(quantity).map(round_unit);
                unit_price = r.amount("derived unit price", derived);
            }
            Some(base)
        }
        (None, None) => {
            if let Some(printed) = printed_base {
                if !quantity.is_zero() {
                    let derived = printed.checked_div(quantity).map(round_unit);
                    unit_price = r.amount("derived unit price", derived);
                }
            }
            printed_base
        }
    };

    let base_price = match base_price {
        Some(base) => base,
        None => {
            if !item_type.exempt_from_tax_check() {
                let cap = tolerances.unpriced_confidence_cap;
                r.flag(FlagKind::Unpriced, cap, "no usable price".to_string());
            }
            Decimal::ZERO
        }
    };

    // 3. Discounts are recorded as printed; base_price already reflects them.

    // 4. Tax
    let (tax_price, total_price) = if forced_tax_free {
        (None, base_price)
    } else {
        let expected = base_price
            .checked_add(tax_in.unwrap_or(Decimal::ZERO))
            .filter(|total| tolerances.amount_in_range(*total));
        match (total_in, expected) {
            (None, Some(expected)) => (tax_in, expected),
            (None, None) => {
                r.mismatch(
                    FlagKind::OutOfRange,
                    format!("base {base_price} + tax {} dropped", tax_in.unwrap_or_default()),
                );
                (None, base_price)
            }
            (Some(total), expected) => {
                let agrees = expected.is_some_and(|e| tolerances.amounts_agree(e, total));
                if !item_type.exempt_from_tax_check() && !agrees {
                    r.mismatch(
                        FlagKind::TaxMismatch,
                        format!("base {base_price} + tax {} != total {total}", tax_in.unwrap_or_default()),
                    );
                }
                (tax_in, total)
            }
        }
    };

    let item = Item {
        sequence: r.sequence,
        name: candidate.name.clone(),
        quantity,
        unit_price,
        base_price,
        discount_amount,
        discount_percentage,
        tax_price,
        tax_percentage: if forced_tax_free { None } else { tax_percentage },
        total_price,
        item_type,
        confidence_score: r.confidence,
        item_metadata: ItemMetadata {
            quantity_format: Some(quantity_format(candidate, quantity)),
            is_weight_based: candidate.is_weight_based,
            weight_unit: candidate.weight_unit.clone(),
            is_voided: candidate.is_voided,
            original_text: candidate.original_text.clone(),
        },
    };
    (item, r.flags)
}

/// Validates a candidate extraction and reconciles it into receipt fields and
/// items. Never fails on arithmetic disagreement, only on unusable structure.
pub fn reconcile(
    candidate: &CandidateExtraction,
    tolerances: &Tolerances,
) -> Result<ReconciledReceipt, ReconcileError> {
    if candidate.items.is_empty() {
        return Err(ReconcileError::NoItems);
    }
    if !candidate.items.iter().any(CandidateItem::has_any_price) {
        return Err(ReconcileError::NoResolvablePrices);
    }

    let mut dropped_fields = Vec::new();
    let mut fields = resolve_fields(&candidate.receipt, tolerances, &mut dropped_fields);

    let mut items = Vec::with_capacity(candidate.items.len());
    let mut flags = Vec::new();
    let mut defaulted_quantities = Vec::new();
    for (index, raw) in candidate.items.iter().enumerate() {
        let (item, item_flags) =
            reconcile_item(index, raw, fields.has_total_tax_only, tolerances);
        if raw.quantity.is_none() {
            defaulted_quantities.push(item.sequence);
        }
        items.push(item);
        flags.extend(item_flags);
    }

    // Voided lines are kept for audit but do not contribute to the sum.
    let computed_total = items
        .iter()
        .filter(|i| !i.item_metadata.is_voided)
        .try_fold(Decimal::ZERO, |sum, i| sum.checked_add(i.total_price))
        .filter(|sum| tolerances.amount_in_range(*sum));

    let mean_item_confidence =
        items.iter().map(|i| i.confidence_score).sum::<f64>() / items.len() as f64;

    let reported_total = fields.total;
    let total_mismatch = match (computed_total, reported_total) {
        (Some(computed), Some(reported)) => !tolerances.totals_agree(computed, reported),
        (None, Some(_)) => true,
        (_, None) => false,
    };

    let mut total_confidence_score = if total_mismatch {
        mean_item_confidence - tolerances.total_mismatch_penalty
    } else {
        mean_item_confidence
    };
    if let Some(reported) = candidate.receipt.confidence_score {
        total_confidence_score = total_confidence_score.min(reported);
    }
    let total_confidence_score = total_confidence_score.clamp(0.0, 1.0);

    if fields.total.is_none() {
        fields.total = computed_total.map(round_money);
    }
    if fields.tax_amount.is_none() && !fields.has_total_tax_only {
        let mut item_tax = items.iter().filter_map(|i| i.tax_price).peekable();
        if item_tax.peek().is_some() {
            fields.tax_amount = item_tax
                .try_fold(Decimal::ZERO, |sum, tax| sum.checked_add(tax))
                .filter(|sum| tolerances.amount_in_range(*sum));
        }
    }

    Ok(ReconciledReceipt {
        fields,
        items,
        total_confidence_score,
        report: ReconciliationReport {
            computed_total,
            reported_total,
            total_mismatch,
            mean_item_confidence,
            flags,
            defaulted_quantities,
            parser_warnings: candidate.warnings.clone(),
            dropped_fields,
        },
    })
}
