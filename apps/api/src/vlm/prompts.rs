use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::models::UnknownVariant;

/// Prompt registry key. Prompt wording is configuration; the parser has to
/// cope with whatever structure either version produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVersion {
    V1,
    V2,
}

impl PromptVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptVersion::V1 => "v1",
            PromptVersion::V2 => "v2",
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            PromptVersion::V1 => RECEIPT_PROMPT_V1,
            PromptVersion::V2 => RECEIPT_PROMPT_V2,
        }
    }
}

impl fmt::Display for PromptVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptVersion {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(PromptVersion::V1),
            "v2" => Ok(PromptVersion::V2),
            other => Err(UnknownVariant::new("prompt version", other)),
        }
    }
}

const RECEIPT_PROMPT_V1: &str = "\
Extract every line item from this receipt image. \
Respond with JSON only, no explanations and no markdown fences, in this shape: \
{\"items\": [{\"item_name\": string, \"item_quantity\": number, \
\"item_unit_price\": number|null, \"item_total_price\": number}], \
\"receipt_total\": number|null}. \
Copy item names exactly as printed. Use null for anything you cannot read.";

const RECEIPT_PROMPT_V2: &str = "\
You are reading a photographed shopping receipt. \
Respond with a single JSON object and nothing else. Do NOT use markdown code fences. \
\n\nTop-level fields: merchant_name, purchase_date (YYYY-MM-DD), currency (ISO 4217 code), \
receipt_category (grocery|restaurant|retail|service|unknown), \
tax_format (added|inclusive|none), has_total_tax_only (true when tax is printed once \
for the whole receipt instead of per line), subtotal, tax_amount, tax_percentage, \
receipt_total, confidence_score (0 to 1), items. \
\n\nEach entry of items: item_name (exactly as printed, do not translate), \
item_quantity (decimal; weight for weighed goods), quantity_format (count|weight|decimal), \
is_weight_based, weight_unit (kg|g|lb|oz|null), item_unit_price, item_base_price \
(price before tax, after any discount), discount_amount, discount_percentage, \
item_tax_price, item_tax_percentage, item_total_price, \
item_type (standard|service_charge|tip|discount), is_voided, original_text, \
confidence_score (0 to 1). \
\n\nRules: numbers are plain JSON numbers without currency symbols. \
Use null for any value that is not printed; never guess. \
List items in printed order. Discount lines carry negative totals.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_version_parses_case_insensitively() {
        assert_eq!("V2".parse::<PromptVersion>().unwrap(), PromptVersion::V2);
        assert_eq!(" v1 ".parse::<PromptVersion>().unwrap(), PromptVersion::V1);
        assert!("v9".parse::<PromptVersion>().is_err());
    }

    #[test]
    fn test_prompts_demand_bare_json() {
        for version in [PromptVersion::V1, PromptVersion::V2] {
            assert!(version.text().contains("item_name"));
            assert!(version.text().contains("JSON"));
        }
    }
}
