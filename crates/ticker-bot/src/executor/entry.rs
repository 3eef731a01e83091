//! Price-chasing limit-buy entry.
//!
//! The entry price is the signal reference plus a small buffer,
//! computed once up front so the chase never drifts upward. The
//! executor places the order, waits a settle interval, measures fills
//! by the change in the held position, and resubmits the remainder up
//! to the attempt bound. Exhaustion accepts whatever filled and
//! cancels the rest.

use std::time::Instant;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use ticker_common::Side;

use crate::config::{EntryConfig, RetryPolicy};
use crate::gateway::{cancel_all, mark_price, BrokerGateway, OrderRequest};

/// Terminal outcome of an entry chase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// The full requested quantity filled.
    Filled,
    /// Some quantity filled before attempts ran out.
    Partial,
    /// Nothing filled.
    Unfilled,
    /// The chase never started.
    Skipped,
}

/// Why an entry chase never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "skip")]
pub enum EntrySkip {
    /// The market moved above the target before the first placement;
    /// chasing it would overpay.
    PriceRanAway { market: Decimal, target: Decimal },
}

/// Result of one entry chase.
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub symbol: String,
    pub requested: Decimal,
    pub filled: Decimal,
    /// Average price across all fills, per the brokerage position read.
    pub avg_price: Decimal,
    /// The buffered limit used for every placement.
    pub limit_price: Decimal,
    pub attempts: u32,
    pub status: EntryStatus,
    pub skip: Option<EntrySkip>,
    pub elapsed_ms: u64,
}

/// Bounded limit-buy chase executor.
pub struct EntryExecutor<'a> {
    gateway: &'a dyn BrokerGateway,
    retry: RetryPolicy,
    config: EntryConfig,
}

impl<'a> EntryExecutor<'a> {
    pub fn new(gateway: &'a dyn BrokerGateway, retry: RetryPolicy, config: EntryConfig) -> Self {
        Self {
            gateway,
            retry,
            config,
        }
    }

    /// Chase a limit buy for `quantity` at the buffered `target`.
    ///
    /// Gateway errors are treated as a no-progress attempt; the chase
    /// never aborts early on them. Fill progress is measured by the
    /// position delta against the pre-chase read, which also captures
    /// fills that land between placements.
    pub async fn execute(&self, symbol: &str, quantity: Decimal, target: Decimal) -> EntryReport {
        let start = Instant::now();
        let limit = (target * (Decimal::ONE + self.config.price_buffer)).round_dp(2);

        // Runaway guard: the market already above the target means the
        // setup is gone; the buffer exists to get filled, not to chase.
        if let Some(market) = mark_price(self.gateway, symbol).await {
            if market > target {
                info!(
                    symbol = %symbol,
                    market = %market,
                    target = %target,
                    "Entry skipped, price ran away"
                );
                return self.report(
                    symbol,
                    quantity,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    limit,
                    0,
                    Some(EntrySkip::PriceRanAway { market, target }),
                    start,
                );
            }
        }

        // Clear anything resting from a previous cycle before
        // measuring the baseline position.
        cancel_all(self.gateway, symbol).await;
        let baseline = match self.gateway.position(symbol).await {
            Ok(position) => position.quantity,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Baseline position read failed, assuming zero");
                Decimal::ZERO
            }
        };

        let mut filled = Decimal::ZERO;
        let mut attempts = 0;

        while attempts < self.retry.max_attempts && filled < quantity {
            attempts += 1;
            let remaining = quantity - filled;
            let request = OrderRequest::limit(symbol, Side::Buy, remaining, limit);
            debug!(
                symbol = %symbol,
                attempt = attempts,
                remaining = %remaining,
                limit = %limit,
                "Placing entry order"
            );

            if let Err(e) = self.gateway.submit_order(request).await {
                warn!(symbol = %symbol, attempt = attempts, error = %e, "Entry order rejected");
            }

            tokio::time::sleep(self.retry.settle_interval()).await;

            match self.gateway.position(symbol).await {
                Ok(position) => {
                    filled = (position.quantity - baseline).max(filled);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Position read failed after settle");
                }
            }

            if filled < quantity {
                // Cancel the resting remainder before the next attempt
                // (or before accepting a partial on exhaustion).
                cancel_all(self.gateway, symbol).await;
            }
        }

        let avg_price = match self.gateway.position(symbol).await {
            Ok(position) if position.avg_entry_price > Decimal::ZERO => position.avg_entry_price,
            _ => limit,
        };

        self.report(symbol, quantity, filled, avg_price, limit, attempts, None, start)
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        symbol: &str,
        requested: Decimal,
        filled: Decimal,
        avg_price: Decimal,
        limit_price: Decimal,
        attempts: u32,
        skip: Option<EntrySkip>,
        start: Instant,
    ) -> EntryReport {
        let status = if skip.is_some() {
            EntryStatus::Skipped
        } else if filled >= requested {
            EntryStatus::Filled
        } else if filled > Decimal::ZERO {
            EntryStatus::Partial
        } else {
            EntryStatus::Unfilled
        };

        let report = EntryReport {
            symbol: symbol.to_string(),
            requested,
            filled,
            avg_price,
            limit_price,
            attempts,
            status,
            skip,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            symbol = %symbol,
            requested = %requested,
            filled = %filled,
            avg_price = %avg_price,
            attempts = attempts,
            status = ?status,
            elapsed_ms = report.elapsed_ms,
            "Entry chase finished"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::PaperGateway;
    use rust_decimal_macros::dec;
    use ticker_common::OrderType;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            settle_interval_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_full_fill_first_attempt() {
        let gateway = PaperGateway::new();
        gateway.set_last_trade("AAPL", dec!(10.00));
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Filled);
        assert_eq!(report.filled, dec!(100));
        assert_eq!(report.attempts, 1);
        // 10.00 * 1.003 = 10.03
        assert_eq!(report.limit_price, dec!(10.03));
        assert_eq!(report.avg_price, dec!(10.03));
    }

    #[tokio::test]
    async fn test_partial_then_remainder_chased() {
        let gateway = PaperGateway::new();
        gateway.set_last_trade("AAPL", dec!(10.00));
        gateway.push_fill_fraction("AAPL", dec!(0.6));
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Filled);
        assert_eq!(report.filled, dec!(100));
        assert_eq!(report.attempts, 2);

        // First placement for 100, second for the remaining 40.
        let submissions = gateway.submissions("AAPL");
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].quantity, dec!(100));
        assert_eq!(submissions[1].quantity, dec!(40));
        assert_eq!(submissions[1].limit_price, submissions[0].limit_price);
    }

    #[tokio::test]
    async fn test_exhaustion_accepts_partial_and_cancels_rest() {
        let gateway = PaperGateway::new();
        gateway.set_last_trade("AAPL", dec!(10.00));
        gateway.push_fill_fraction("AAPL", dec!(0.6));
        gateway.push_fill_fraction("AAPL", Decimal::ZERO);
        gateway.push_fill_fraction("AAPL", Decimal::ZERO);
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Partial);
        assert_eq!(report.filled, dec!(60));
        assert_eq!(report.attempts, 3);
        // Nothing left resting.
        assert_eq!(gateway.open_order_count("AAPL"), 0);
    }

    #[tokio::test]
    async fn test_rejections_exhaust_to_unfilled() {
        let gateway = PaperGateway::new();
        gateway.set_last_trade("AAPL", dec!(10.00));
        for _ in 0..3 {
            gateway.push_rejection("AAPL", "insufficient buying power");
        }
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Unfilled);
        assert_eq!(report.filled, Decimal::ZERO);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_runaway_price_skips_entry() {
        let gateway = PaperGateway::new();
        gateway.set_last_trade("AAPL", dec!(10.50));
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Skipped);
        assert!(matches!(
            report.skip,
            Some(EntrySkip::PriceRanAway { .. })
        ));
        assert!(gateway.submissions("AAPL").is_empty());
    }

    #[tokio::test]
    async fn test_market_inside_buffer_still_counts_as_runaway() {
        // Market at 10.02 sits between the 10.00 target and the 10.03
        // buffered limit; the guard keys off the target.
        let gateway = PaperGateway::new();
        gateway.set_last_trade("AAPL", dec!(10.02));
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Skipped);
        assert!(gateway.submissions("AAPL").is_empty());

        // At the target exactly, the chase proceeds.
        gateway.set_last_trade("AAPL", dec!(10.00));
        let report = executor.execute("AAPL", dec!(100), dec!(10.00)).await;
        assert_eq!(report.status, EntryStatus::Filled);
    }

    #[tokio::test]
    async fn test_missing_market_price_does_not_block_entry() {
        // No quote or last trade at all: the guard cannot fire, the
        // chase proceeds on the buffered limit.
        let gateway = PaperGateway::new();
        let executor = EntryExecutor::new(&gateway, fast_retry(), EntryConfig::default());

        let report = executor.execute("AAPL", dec!(50), dec!(4.00)).await;
        assert_eq!(report.status, EntryStatus::Filled);
        let submissions = gateway.submissions("AAPL");
        assert_eq!(submissions[0].order_type, OrderType::Limit);
        assert_eq!(submissions[0].limit_price, Some(dec!(4.01)));
    }
}
