//! Field coercion for loosely typed model output.
//!
//! Every coercion distinguishes three outcomes: the field is absent (`Ok(None)`),
//! usable (`Ok(Some(_))`), or present but unusable (`Err(reason)`). Callers turn
//! unusable optional fields into nulls plus a warning.

use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

pub type Coerced<T> = Result<Option<T>, String>;

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₩', '₹', '₱', '฿', '₫', '₪'];
const WEIGHT_UNITS: &[&str] = &["kg", "g", "lb", "lbs", "oz"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%d/%m/%Y", "%m/%d/%Y"];

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s == "-" || s.eq_ignore_ascii_case("n/a")
        }
        _ => false,
    }
}

fn decimal_from_plain(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// Parses a printed amount such as `"$1,234.50"`, `"1.234,50 €"`, `"(2.00)"`
/// or `"2.00-"` into a decimal.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !CURRENCY_SYMBOLS.contains(c))
        .collect();

    // ISO currency codes glued to the amount ("USD12.00", "12.00EUR").
    s = s
        .trim_matches(|c: char| c.is_ascii_alphabetic())
        .to_string();

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') && s.len() > 2 {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    if let Some(stripped) = s.strip_suffix('-') {
        negative = true;
        s = stripped.to_string();
    }
    if let Some(stripped) = s.strip_prefix('-') {
        negative = !negative;
        s = stripped.to_string();
    }
    if s.is_empty() {
        return None;
    }

    let normalized = match (s.rfind('.'), s.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = s.len() - comma - 1;
            if s.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        _ => s,
    };

    if !normalized
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return None;
    }
    let value = decimal_from_plain(&normalized)?;
    Some(if negative { -value } else { value })
}

pub fn decimal(value: &Value) -> Coerced<Decimal> {
    if is_blank(value) {
        return Ok(None);
    }
    match value {
        Value::Number(n) => decimal_from_plain(&n.to_string())
            .map(Some)
            .ok_or_else(|| format!("number {n} is out of range")),
        Value::String(s) => parse_amount(s)
            .map(Some)
            .ok_or_else(|| format!("'{s}' is not a number")),
        other => Err(format!("expected a number, got {other}")),
    }
}

/// A rate printed as `8.25`, `"8.25"` or `"8.25%"`. The value stays in
/// percent; `"8.25%"` becomes `8.25`.
pub fn percentage(value: &Value) -> Coerced<Decimal> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim().trim_end_matches('%').trim_end();
            if trimmed.is_empty() {
                return Ok(None);
            }
            parse_amount(trimmed)
                .map(Some)
                .ok_or_else(|| format!("'{s}' is not a percentage"))
        }
        other => decimal(other),
    }
}

/// A quantity with the unit it was printed with, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: Decimal,
    pub weight_unit: Option<String>,
}

/// Parses quantities like `2`, `"3x"`, `"x3"`, `"0.456 kg"` or `"1,5kg"`.
pub fn quantity(value: &Value) -> Coerced<Quantity> {
    if is_blank(value) {
        return Ok(None);
    }
    let text = match value {
        Value::Number(_) => {
            return decimal(value).map(|d| {
                d.map(|value| Quantity {
                    value,
                    weight_unit: None,
                })
            })
        }
        Value::String(s) => s.trim().to_lowercase(),
        other => return Err(format!("expected a quantity, got {other}")),
    };

    let text = text
        .trim_start_matches(['x', '×'])
        .trim_end_matches(['x', '×'])
        .trim();
    let split = text
        .find(|c: char| c.is_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let unit = unit.trim().trim_end_matches('.');

    let value = parse_amount(number).ok_or_else(|| format!("'{text}' is not a quantity"))?;
    let weight_unit = if unit.is_empty() {
        None
    } else if WEIGHT_UNITS.contains(&unit) {
        Some(unit.to_string())
    } else {
        // Count units ("pcs", "ea") carry no extra meaning.
        None
    };
    Ok(Some(Quantity { value, weight_unit }))
}

pub fn text(value: &Value) -> Coerced<String> {
    if is_blank(value) {
        return Ok(None);
    }
    match value {
        Value::String(s) => Ok(Some(s.trim().to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(format!("expected text, got {other}")),
    }
}

pub fn boolean(value: &Value) -> Coerced<bool> {
    if value.is_null() {
        return Ok(None);
    }
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(format!("{n} is not a boolean")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Some(true)),
            "false" | "no" | "n" | "0" | "" => Ok(Some(false)),
            other => Err(format!("'{other}' is not a boolean")),
        },
        other => Err(format!("expected a boolean, got {other}")),
    }
}

/// Confidence in [0, 1]. Percentages (1 < x ≤ 100) are rescaled.
pub fn confidence(value: &Value) -> Coerced<f64> {
    if is_blank(value) {
        return Ok(None);
    }
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("{value} is not a confidence score"))?;

    let scaled = if raw > 1.0 && raw <= 100.0 {
        raw / 100.0
    } else {
        raw
    };
    if (0.0..=1.0).contains(&scaled) {
        Ok(Some(scaled))
    } else {
        Err(format!("confidence {raw} is out of range"))
    }
}

pub fn date(value: &Value) -> Coerced<NaiveDate> {
    let Some(s) = text(value)? else {
        return Ok(None);
    };
    // Timestamps ("2024-03-01T12:30:00") keep only the date part.
    let candidate = s.split(['T', ' ']).next().unwrap_or(s.as_str());
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
        .map(Some)
        .ok_or_else(|| format!("'{s}' is not a recognised date"))
}
