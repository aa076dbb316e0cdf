use rust_decimal::Decimal;

/// Reconciliation thresholds. These are tuning values, not a contract;
/// every numeric field is overridable from the environment (see `Config`).
#[derive(Debug, Clone)]
pub struct Tolerances {
    /// Relative tolerance for `quantity × unit_price ≈ base_price`.
    pub price_relative: Decimal,
    /// Absolute tolerance for `base_price + tax_price ≈ total_price`.
    pub tax_epsilon: Decimal,
    /// Receipt total tolerance is `max(total_absolute, total_relative × |total|)`.
    pub total_absolute: Decimal,
    pub total_relative: Decimal,
    /// Ceiling applied to an item's confidence when its arithmetic disagrees.
    pub mismatch_confidence_cap: f64,
    /// Ceiling for a standard item printed without any usable price.
    pub unpriced_confidence_cap: f64,
    /// Subtracted from the mean item confidence on a receipt total mismatch.
    pub total_mismatch_penalty: f64,
    /// Confidence assumed when the model reports none for an item.
    pub default_item_confidence: f64,
    /// Largest money or quantity magnitude that can be stored (`NUMERIC(14, 4)`).
    pub max_amount: Decimal,
    /// Largest percentage magnitude that can be stored (`NUMERIC(7, 4)`).
    pub max_percentage: Decimal,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            price_relative: Decimal::new(5, 2),
            tax_epsilon: Decimal::new(2, 2),
            total_absolute: Decimal::new(5, 2),
            total_relative: Decimal::new(1, 2),
            mismatch_confidence_cap: 0.69,
            unpriced_confidence_cap: 0.30,
            total_mismatch_penalty: 0.15,
            default_item_confidence: 1.0,
            max_amount: Decimal::new(99_999_999_999_999, 4),
            max_percentage: Decimal::new(9_999_999, 4),
        }
    }
}

impl Tolerances {
    /// `|expected − actual| / |actual| ≤ price_relative`. A zero `actual`
    /// falls back to the absolute tax epsilon. Overflow counts as disagreement.
    pub fn prices_agree(&self, expected: Decimal, actual: Decimal) -> bool {
        let Some(diff) = expected.checked_sub(actual).map(|d| d.abs()) else {
            return false;
        };
        if actual.is_zero() {
            return diff <= self.tax_epsilon;
        }
        diff.checked_div(actual.abs())
            .is_some_and(|relative| relative <= self.price_relative)
    }

    pub fn amounts_agree(&self, expected: Decimal, actual: Decimal) -> bool {
        expected
            .checked_sub(actual)
            .is_some_and(|diff| diff.abs() <= self.tax_epsilon)
    }

    pub fn totals_agree(&self, computed: Decimal, reported: Decimal) -> bool {
        let Some(relative) = self.total_relative.checked_mul(reported.abs()) else {
            return false;
        };
        let allowed = self.total_absolute.max(relative);
        computed
            .checked_sub(reported)
            .is_some_and(|diff| diff.abs() <= allowed)
    }

    pub fn amount_in_range(&self, value: Decimal) -> bool {
        value.abs() <= self.max_amount
    }

    pub fn percentage_in_range(&self, value: Decimal) -> bool {
        value.abs() <= self.max_percentage
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_prices_agree_within_five_percent() {
        let t = Tolerances::default();
        assert!(t.prices_agree(d("3.75"), d("3.80")));
        assert!(!t.prices_agree(d("3.75"), d("5.00")));
    }

    #[test]
    fn test_prices_agree_with_zero_base() {
        let t = Tolerances::default();
        assert!(t.prices_agree(d("0.01"), d("0")));
        assert!(!t.prices_agree(d("1.00"), d("0")));
    }

    #[test]
    fn test_totals_use_larger_of_absolute_and_relative() {
        let t = Tolerances::default();
        // Small receipt: absolute $0.05 dominates.
        assert!(t.totals_agree(d("2.04"), d("2.00")));
        assert!(!t.totals_agree(d("2.06"), d("2.00")));
        // Large receipt: 1% dominates.
        assert!(t.totals_agree(d("500.00"), d("504.00")));
        assert!(!t.totals_agree(d("500.00"), d("506.00")));
    }

    #[test]
    fn test_comparisons_never_overflow() {
        let t = Tolerances::default();
        assert!(!t.prices_agree(Decimal::MAX, Decimal::MIN));
        assert!(!t.prices_agree(Decimal::MAX, d("0.0000000000000000000001")));
        assert!(!t.amounts_agree(Decimal::MIN, Decimal::MAX));
        assert!(!t.totals_agree(d("1"), Decimal::MAX));
    }

    #[test]
    fn test_storable_ranges() {
        let t = Tolerances::default();
        assert!(t.amount_in_range(d("9999999999.9999")));
        assert!(!t.amount_in_range(d("10000000000")));
        assert!(t.percentage_in_range(d("-999.9999")));
        assert!(!t.percentage_in_range(d("1000")));
    }
}
