//! Order executors.
//!
//! The entry executor chases a limit buy for a bounded number of
//! attempts; the exit executor tries a target price first and then
//! degrades into an aggressive descending ladder with a hard
//! deadline. Both consume the same `RetryPolicy` and pace themselves
//! with sleeps between placements to respect settlement latency.

pub mod entry;
pub mod exit;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Ladder price increment, scaled to price magnitude.
///
/// Cheap instruments get relatively larger increments so the ladder
/// makes meaningful progress through a thin book: 2 cents under $1,
/// 5 cents under $10, 10 cents above.
pub(crate) fn ladder_tick(price: Decimal) -> Decimal {
    if price < dec!(1) {
        dec!(0.02)
    } else if price < dec!(10) {
        dec!(0.05)
    } else {
        dec!(0.10)
    }
}

/// Volume-weighted average price of accumulated fills.
pub(crate) fn weighted_avg(fills: &[(Decimal, Decimal)]) -> Decimal {
    let total: Decimal = fills.iter().map(|(qty, _)| *qty).sum();
    if total == Decimal::ZERO {
        return Decimal::ZERO;
    }
    let value: Decimal = fills.iter().map(|(qty, price)| *qty * *price).sum();
    value / total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_tick_scales_with_magnitude() {
        assert_eq!(ladder_tick(dec!(0.45)), dec!(0.02));
        assert_eq!(ladder_tick(dec!(4.20)), dec!(0.05));
        assert_eq!(ladder_tick(dec!(42.00)), dec!(0.10));
    }

    #[test]
    fn test_weighted_avg() {
        let fills = vec![(dec!(60), dec!(10.00)), (dec!(40), dec!(10.10))];
        assert_eq!(weighted_avg(&fills), dec!(10.04));
        assert_eq!(weighted_avg(&[]), Decimal::ZERO);
    }
}
