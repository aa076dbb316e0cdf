use serde_json::{Map, Value};
use tracing::debug;

use crate::extraction::candidate::{CandidateExtraction, CandidateItem, CandidateReceipt};
use crate::extraction::coerce::{self, Coerced};
use crate::extraction::repair::{locate_json, repair_json};
use crate::extraction::ParseError;

const ITEM_ARRAY_KEYS: &[&str] = &["items", "line_items", "receipt_items"];

/// Parses raw VLM output into a candidate extraction.
///
/// Fails only when no JSON can be recovered, the items array is missing, or an
/// item has no usable name. Any other unusable field becomes `None` and is
/// recorded in `warnings`.
pub fn parse(raw_text: &str) -> Result<CandidateExtraction, ParseError> {
    let body = locate_json(raw_text).ok_or(ParseError::NoJson)?;

    let root: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(first) => {
            debug!("Model output is not strict JSON ({first}), attempting repair");
            serde_json::from_str(&repair_json(&body))
                .map_err(|e| ParseError::Unrecoverable(e.to_string()))?
        }
    };

    from_value(&root)
}

fn from_value(root: &Value) -> Result<CandidateExtraction, ParseError> {
    let mut warnings = Vec::new();

    let (fields, items) = match root {
        Value::Array(_) => (None, Some(root)),
        Value::Object(obj) => {
            let nested = obj.get("receipt").and_then(Value::as_object);
            let items = lookup(obj, ITEM_ARRAY_KEYS)
                .or_else(|| nested.and_then(|n| lookup(n, ITEM_ARRAY_KEYS)))
                .map(|(_, v)| v);
            (Some(nested.unwrap_or(obj)), items)
        }
        _ => (None, None),
    };

    let items = items
        .and_then(Value::as_array)
        .ok_or(ParseError::MissingItems)?;

    let receipt = fields
        .map(|obj| parse_receipt(obj, &mut warnings))
        .unwrap_or_default();

    let items = items
        .iter()
        .enumerate()
        .map(|(index, value)| parse_item(index, value, &mut warnings))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CandidateExtraction {
        receipt,
        items,
        warnings,
    })
}

/// First non-null value under any of `keys`.
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
}

fn optional<T>(
    obj: &Map<String, Value>,
    keys: &[&'static str],
    coerce: impl Fn(&Value) -> Coerced<T>,
    context: &str,
    warnings: &mut Vec<String>,
) -> Option<T> {
    let (key, value) = lookup(obj, keys)?;
    match coerce(value) {
        Ok(v) => v,
        Err(reason) => {
            warnings.push(format!("{context}.{key}: {reason}"));
            None
        }
    }
}

fn currency_code(value: &Value) -> Coerced<String> {
    let Some(text) = coerce::text(value)? else {
        return Ok(None);
    };
    let code = match text.as_str() {
        "$" => "USD".to_string(),
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        "¥" => "JPY".to_string(),
        other => other.to_ascii_uppercase(),
    };
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(Some(code))
    } else {
        Err(format!("'{text}' is not an ISO currency code"))
    }
}

fn lowercase_text(value: &Value) -> Coerced<String> {
    Ok(coerce::text(value)?.map(|s| s.to_lowercase()))
}

fn parse_receipt(obj: &Map<String, Value>, warnings: &mut Vec<String>) -> CandidateReceipt {
    let ctx = "receipt";
    CandidateReceipt {
        merchant_name: optional(
            obj,
            &["merchant_name", "merchant", "store_name", "store"],
            coerce::text,
            ctx,
            warnings,
        ),
        purchase_date: optional(
            obj,
            &["receipt_date", "purchase_date", "date"],
            coerce::date,
            ctx,
            warnings,
        ),
        currency: optional(obj, &["currency", "currency_code"], currency_code, ctx, warnings),
        receipt_category: optional(
            obj,
            &["receipt_category", "category"],
            lowercase_text,
            ctx,
            warnings,
        ),
        tax_format: optional(obj, &["tax_format"], lowercase_text, ctx, warnings),
        has_total_tax_only: optional(
            obj,
            &["has_total_tax_only", "total_tax_only"],
            coerce::boolean,
            ctx,
            warnings,
        ),
        subtotal: optional(
            obj,
            &["receipt_subtotal", "subtotal"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        tax_amount: optional(
            obj,
            &["receipt_tax_amount", "tax_amount", "total_tax", "tax"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        tax_percentage: optional(
            obj,
            &["receipt_tax_percentage", "tax_percentage", "tax_rate"],
            coerce::percentage,
            ctx,
            warnings,
        ),
        total: optional(
            obj,
            &["receipt_total", "total", "total_amount", "grand_total"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        confidence_score: optional(
            obj,
            &["total_confidence_score", "confidence_score", "confidence"],
            coerce::confidence,
            ctx,
            warnings,
        ),
    }
}

fn parse_item(
    index: usize,
    value: &Value,
    warnings: &mut Vec<String>,
) -> Result<CandidateItem, ParseError> {
    let obj = value.as_object().ok_or_else(|| ParseError::InvalidItem {
        index,
        reason: "not an object".to_string(),
    })?;

    let name = match lookup(obj, &["item_name", "name", "description"]) {
        Some((_, v)) => coerce::text(v)
            .map_err(|reason| ParseError::InvalidItem { index, reason })?
            .filter(|s| !s.is_empty()),
        None => None,
    }
    .ok_or_else(|| ParseError::InvalidItem {
        index,
        reason: "missing item name".to_string(),
    })?;

    let ctx = format!("items[{index}]");
    let ctx = ctx.as_str();

    let quantity = optional(
        obj,
        &["item_quantity", "quantity", "qty"],
        coerce::quantity,
        ctx,
        warnings,
    );
    let declared_weight_based =
        optional(obj, &["is_weight_based"], coerce::boolean, ctx, warnings).unwrap_or(false);
    let declared_unit = optional(obj, &["weight_unit"], lowercase_text, ctx, warnings);
    let parsed_unit = quantity.as_ref().and_then(|q| q.weight_unit.clone());

    Ok(CandidateItem {
        name,
        quantity: quantity.map(|q| q.value),
        quantity_format: optional(
            obj,
            &["quantity_format", "item_quantity_format"],
            lowercase_text,
            ctx,
            warnings,
        ),
        is_weight_based: declared_weight_based || parsed_unit.is_some(),
        weight_unit: declared_unit.or(parsed_unit),
        unit_price: optional(
            obj,
            &["item_unit_price", "unit_price", "price_per_unit"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        base_price: optional(
            obj,
            &["item_base_price", "base_price"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        discount_amount: optional(
            obj,
            &["item_discount_amount", "discount_amount", "discount"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        discount_percentage: optional(
            obj,
            &["item_discount_percentage", "discount_percentage"],
            coerce::percentage,
            ctx,
            warnings,
        ),
        tax_price: optional(
            obj,
            &["item_tax_price", "tax_price", "item_tax", "tax_amount"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        tax_percentage: optional(
            obj,
            &["item_tax_percentage", "tax_percentage", "tax_rate"],
            coerce::percentage,
            ctx,
            warnings,
        ),
        total_price: optional(
            obj,
            &["item_total_price", "total_price", "total", "price", "amount"],
            coerce::decimal,
            ctx,
            warnings,
        ),
        item_type: optional(obj, &["item_type", "type"], lowercase_text, ctx, warnings),
        confidence_score: optional(
            obj,
            &["confidence_score", "item_confidence", "confidence"],
            coerce::confidence,
            ctx,
            warnings,
        ),
        is_voided: optional(obj, &["is_voided", "voided"], coerce::boolean, ctx, warnings)
            .unwrap_or(false),
        original_text: optional(obj, &["original_text", "raw_text"], coerce::text, ctx, warnings),
    })
}
