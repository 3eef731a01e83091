//! Position lifecycle and the per-symbol position book.
//!
//! One position exists per symbol at most. The book owns every
//! position record; the watcher only ever reads it and triggers an
//! exit. Lifecycle transitions go FLAT → ENTERING → OPEN → EXITING →
//! FLAT, where FLAT is represented by the record being absent.
//!
//! The book also arbitrates watcher ownership so that at most one
//! watcher task is ever active per symbol.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::signal::SignalSource;

/// Position lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionState {
    Flat,
    Entering,
    Open,
    Exiting,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionState::Flat => write!(f, "flat"),
            PositionState::Entering => write!(f, "entering"),
            PositionState::Open => write!(f, "open"),
            PositionState::Exiting => write!(f, "exiting"),
        }
    }
}

/// A held position for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub stop_price: Decimal,
    pub entry_source: SignalSource,
    pub add_used: bool,
    pub state: PositionState,
    pub opened_at: DateTime<Utc>,
}

/// Table of per-symbol positions plus the watcher ownership set.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: DashMap<String, Position>,
    watchers: DashSet<String>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the FLAT → ENTERING transition.
    ///
    /// Returns false if any position record already exists for the
    /// symbol, which serializes concurrent entry attempts.
    pub fn try_begin_entry(&self, symbol: &str, source: SignalSource, stop_price: Decimal) -> bool {
        match self.positions.entry(symbol.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Position {
                    symbol: symbol.to_string(),
                    quantity: Decimal::ZERO,
                    avg_entry_price: Decimal::ZERO,
                    stop_price,
                    entry_source: source,
                    add_used: false,
                    state: PositionState::Entering,
                    opened_at: Utc::now(),
                });
                true
            }
        }
    }

    /// ENTERING → OPEN once the entry executor achieved a fill.
    pub fn commit_entry(&self, symbol: &str, quantity: Decimal, avg_entry_price: Decimal) {
        if let Some(mut position) = self.positions.get_mut(symbol) {
            position.quantity = quantity;
            position.avg_entry_price = avg_entry_price;
            position.state = PositionState::Open;
            debug!(
                symbol = %symbol,
                quantity = %quantity,
                avg_entry_price = %avg_entry_price,
                stop_price = %position.stop_price,
                "Position opened"
            );
        }
    }

    /// Drop an ENTERING record that never achieved a fill.
    pub fn abandon_entry(&self, symbol: &str) {
        self.positions
            .remove_if(symbol, |_, position| position.state == PositionState::Entering);
    }

    /// Record an add fill: quantity and average entry change, the add
    /// is consumed, the stop stays where the original entry put it.
    pub fn record_add(&self, symbol: &str, quantity: Decimal, avg_entry_price: Decimal) {
        if let Some(mut position) = self.positions.get_mut(symbol) {
            position.quantity = quantity;
            position.avg_entry_price = avg_entry_price;
            position.add_used = true;
        }
    }

    /// OPEN → EXITING. Returns a snapshot of the position, or `None`
    /// if the symbol is not currently open (which makes a second
    /// concurrent exit a no-op).
    pub fn begin_exit(&self, symbol: &str) -> Option<Position> {
        let mut position = self.positions.get_mut(symbol)?;
        if position.state != PositionState::Open {
            return None;
        }
        position.state = PositionState::Exiting;
        Some(position.clone())
    }

    /// Settle an exit: a drained position is removed (FLAT); a
    /// remainder reopens with the leftover quantity so supervision can
    /// resume.
    pub fn settle_exit(&self, symbol: &str, remaining: Decimal) {
        if remaining <= Decimal::ZERO {
            self.positions.remove(symbol);
            debug!(symbol = %symbol, "Position flat");
        } else if let Some(mut position) = self.positions.get_mut(symbol) {
            position.quantity = remaining;
            position.state = PositionState::Open;
            debug!(symbol = %symbol, remaining = %remaining, "Exit left a remainder, position reopened");
        }
    }

    /// Snapshot of one position.
    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|p| p.clone())
    }

    /// Lifecycle state; absent records are FLAT.
    pub fn state(&self, symbol: &str) -> PositionState {
        self.positions
            .get(symbol)
            .map(|p| p.state)
            .unwrap_or(PositionState::Flat)
    }

    /// Whether any non-flat record exists.
    pub fn is_active(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    /// Snapshot of all positions.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.iter().map(|p| p.clone()).collect()
    }

    /// Claim the single watcher slot for a symbol.
    pub fn try_claim_watcher(&self, symbol: &str) -> bool {
        self.watchers.insert(symbol.to_string())
    }

    /// Release the watcher slot.
    pub fn release_watcher(&self, symbol: &str) {
        self.watchers.remove(symbol);
    }

    /// Whether a watcher currently owns the symbol.
    pub fn has_watcher(&self, symbol: &str) -> bool {
        self.watchers.contains(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_lifecycle() {
        let book = PositionBook::new();
        assert_eq!(book.state("AAPL"), PositionState::Flat);

        assert!(book.try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.20)));
        assert_eq!(book.state("AAPL"), PositionState::Entering);
        // A second claim fails while the first is in flight.
        assert!(!book.try_begin_entry("AAPL", SignalSource::Momentum, dec!(9.00)));

        book.commit_entry("AAPL", dec!(100), dec!(10.01));
        let position = book.get("AAPL").unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.quantity, dec!(100));
        assert_eq!(position.stop_price, dec!(9.20));
        assert!(!position.add_used);
    }

    #[test]
    fn test_abandon_entry_only_drops_entering_records() {
        let book = PositionBook::new();
        book.try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.20));
        book.abandon_entry("AAPL");
        assert_eq!(book.state("AAPL"), PositionState::Flat);

        book.try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.20));
        book.commit_entry("AAPL", dec!(100), dec!(10));
        book.abandon_entry("AAPL");
        assert_eq!(book.state("AAPL"), PositionState::Open);
    }

    #[test]
    fn test_exit_drains_to_flat() {
        let book = PositionBook::new();
        book.try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.20));
        book.commit_entry("AAPL", dec!(100), dec!(10));

        let snapshot = book.begin_exit("AAPL").unwrap();
        assert_eq!(snapshot.quantity, dec!(100));
        assert_eq!(book.state("AAPL"), PositionState::Exiting);
        // A concurrent exit sees nothing to do.
        assert!(book.begin_exit("AAPL").is_none());

        book.settle_exit("AAPL", Decimal::ZERO);
        assert_eq!(book.state("AAPL"), PositionState::Flat);
    }

    #[test]
    fn test_exit_remainder_reopens() {
        let book = PositionBook::new();
        book.try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.20));
        book.commit_entry("AAPL", dec!(100), dec!(10));
        book.begin_exit("AAPL").unwrap();
        book.settle_exit("AAPL", dec!(25));
        let position = book.get("AAPL").unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.quantity, dec!(25));
    }

    #[test]
    fn test_record_add_consumes_add_flag() {
        let book = PositionBook::new();
        book.try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.20));
        book.commit_entry("AAPL", dec!(100), dec!(10));
        book.record_add("AAPL", dec!(150), dec!(10.20));
        let position = book.get("AAPL").unwrap();
        assert_eq!(position.quantity, dec!(150));
        assert_eq!(position.avg_entry_price, dec!(10.20));
        assert!(position.add_used);
        assert_eq!(position.stop_price, dec!(9.20));
    }

    #[test]
    fn test_watcher_slot_is_exclusive() {
        let book = PositionBook::new();
        assert!(book.try_claim_watcher("AAPL"));
        assert!(!book.try_claim_watcher("AAPL"));
        assert!(book.has_watcher("AAPL"));
        book.release_watcher("AAPL");
        assert!(!book.has_watcher("AAPL"));
        assert!(book.try_claim_watcher("AAPL"));
    }
}
