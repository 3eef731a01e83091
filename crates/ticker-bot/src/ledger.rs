//! Append-only record of realized trades.
//!
//! Every terminal exit fill lands here. Besides the raw entries the
//! ledger answers two questions: what was the most recent entry price
//! for a symbol (used when an exit signal arrives without a stored
//! entry reference), and how is the session going overall.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

/// Why the exit happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Explicit exit signal.
    Signal,
    /// Stop-loss breach detected by the watcher.
    StopLoss,
    /// Trailing take-profit: drawdown from the peak price reached the
    /// configured fraction.
    TrailingTake,
    /// Exit forced by the deadline fallback.
    Deadline,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Signal => write!(f, "signal"),
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TrailingTake => write!(f, "trailing_take"),
            ExitReason::Deadline => write!(f, "deadline"),
        }
    }
}

/// A realized trade.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Realized PnL in currency.
    pub pnl: Decimal,
    /// Realized PnL as a fraction of the entry price.
    pub pnl_pct: Decimal,
    pub reason: ExitReason,
    pub closed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

/// Aggregate session statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LedgerStats {
    pub trades: usize,
    pub wins: usize,
    /// Win rate as a fraction; zero with no trades.
    pub win_rate: Decimal,
    pub total_pnl: Decimal,
}

/// Append-only trade ledger.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a realized exit.
    pub fn record_exit(
        &self,
        symbol: &str,
        quantity: Decimal,
        entry_price: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> LedgerEntry {
        let pnl = (exit_price - entry_price) * quantity;
        let pnl_pct = if entry_price > Decimal::ZERO {
            (exit_price - entry_price) / entry_price
        } else {
            Decimal::ZERO
        };
        let entry = LedgerEntry {
            symbol: symbol.to_string(),
            quantity,
            entry_price,
            exit_price,
            pnl,
            pnl_pct,
            reason,
            closed_at: Utc::now(),
        };

        info!(
            symbol = %symbol,
            quantity = %quantity,
            entry_price = %entry_price,
            exit_price = %exit_price,
            pnl = %pnl,
            reason = %reason,
            "Trade realized"
        );

        self.entries.write().push(entry.clone());
        entry
    }

    /// Most recent recorded entry price for a symbol.
    pub fn last_entry_price(&self, symbol: &str) -> Option<Decimal> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|entry| entry.symbol == symbol)
            .map(|entry| entry.entry_price)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().clone()
    }

    /// Aggregate statistics for observability.
    pub fn stats(&self) -> LedgerStats {
        let entries = self.entries.read();
        let trades = entries.len();
        let wins = entries.iter().filter(|entry| entry.is_win()).count();
        let total_pnl = entries.iter().map(|entry| entry.pnl).sum();
        let win_rate = if trades > 0 {
            Decimal::from(wins as u64) / Decimal::from(trades as u64)
        } else {
            Decimal::ZERO
        };
        LedgerStats {
            trades,
            wins,
            win_rate,
            total_pnl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_record_exit_computes_pnl() {
        let ledger = Ledger::new();
        let entry = ledger.record_exit("AAPL", dec!(100), dec!(10), dec!(10.50), ExitReason::Signal);
        assert_eq!(entry.pnl, dec!(50));
        assert_eq!(entry.pnl_pct, dec!(0.05));
        assert!(entry.is_win());
    }

    #[test]
    fn test_losing_trade() {
        let ledger = Ledger::new();
        let entry =
            ledger.record_exit("AAPL", dec!(100), dec!(10), dec!(9.20), ExitReason::StopLoss);
        assert_eq!(entry.pnl, dec!(-80));
        assert_eq!(entry.pnl_pct, dec!(-0.08));
        assert!(!entry.is_win());
    }

    #[test]
    fn test_last_entry_price_returns_most_recent() {
        let ledger = Ledger::new();
        ledger.record_exit("AAPL", dec!(100), dec!(10), dec!(11), ExitReason::Signal);
        ledger.record_exit("TSLA", dec!(10), dec!(200), dec!(210), ExitReason::Signal);
        ledger.record_exit("AAPL", dec!(50), dec!(12), dec!(11.50), ExitReason::StopLoss);
        assert_eq!(ledger.last_entry_price("AAPL"), Some(dec!(12)));
        assert_eq!(ledger.last_entry_price("TSLA"), Some(dec!(200)));
        assert_eq!(ledger.last_entry_price("NVDA"), None);
    }

    #[test]
    fn test_stats() {
        let ledger = Ledger::new();
        assert_eq!(ledger.stats().trades, 0);
        assert_eq!(ledger.stats().win_rate, Decimal::ZERO);

        ledger.record_exit("AAPL", dec!(100), dec!(10), dec!(11), ExitReason::Signal);
        ledger.record_exit("AAPL", dec!(100), dec!(10), dec!(9), ExitReason::StopLoss);
        ledger.record_exit("TSLA", dec!(10), dec!(100), dec!(120), ExitReason::Signal);

        let stats = ledger.stats();
        assert_eq!(stats.trades, 3);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.total_pnl, dec!(200));
        assert!(stats.win_rate > dec!(0.66) && stats.win_rate < dec!(0.67));
    }
}
