//! Regime-aware stop pricing.
//!
//! The stop is derived from the signal's reference candle. During the
//! open-auction window a supplied volatility measure widens the stop
//! below the candle low; outside it the low itself is the stop. A
//! candle whose low-to-close range exceeds the configured maximum
//! disqualifies the signal outright: an oversized signal candle is
//! treated as unreliable and no entry happens.

use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Serialize;

use ticker_common::Candle;

use crate::config::StopConfig;

/// Why a stop could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum StopRejection {
    /// (close - low) / close exceeded the configured maximum.
    OversizedRange {
        fraction: Decimal,
        max_fraction: Decimal,
    },
}

impl std::fmt::Display for StopRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopRejection::OversizedRange {
                fraction,
                max_fraction,
            } => write!(
                f,
                "candle range {fraction} exceeds maximum {max_fraction}"
            ),
        }
    }
}

/// Pure stop-price calculator.
#[derive(Debug, Clone)]
pub struct StopCalculator {
    config: StopConfig,
}

impl StopCalculator {
    pub fn new(config: StopConfig) -> Self {
        Self { config }
    }

    /// Compute the stop price for a signal candle.
    ///
    /// Invariant: the returned stop is never above the reference close.
    /// Inside the open-auction window, with a positive volatility
    /// measure, the stop is `min(low, close - k * volatility)` — never
    /// tighter than the candle low. Everywhere else it is the low.
    pub fn compute(
        &self,
        candle: &Candle,
        volatility: Option<Decimal>,
        now: NaiveTime,
    ) -> Result<Decimal, StopRejection> {
        let fraction = candle.range_fraction();
        if fraction > self.config.max_range_fraction {
            return Err(StopRejection::OversizedRange {
                fraction,
                max_fraction: self.config.max_range_fraction,
            });
        }

        if self.config.in_open_auction(now) {
            if let Some(vol) = volatility.filter(|v| *v > Decimal::ZERO) {
                let widened = candle.close - self.config.volatility_multiplier * vol;
                return Ok(candle.low.min(widened));
            }
        }

        Ok(candle.low)
    }
}
