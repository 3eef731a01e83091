//! Per-symbol admission control.
//!
//! The session gate decides whether a signal may proceed to
//! execution. Decisions are structured outcomes, never errors. State
//! is held in per-symbol records inside a concurrent map; no caller
//! ever touches a shared mutable map directly.
//!
//! Invariant: `loss_count` is monotonically non-decreasing within a
//! session. It increments only on stop-triggered exits and resets only
//! at the daily boundary (or, under the `on-flatten` policy, when a
//! position is closed voluntarily).

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{LossResetPolicy, SessionConfig};
use crate::signal::SignalSource;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "admission")]
pub enum Admission {
    /// Signal may proceed to execution.
    Admitted,
    /// Symbol is locked out after repeated stop losses.
    Blocked { loss_count: u32 },
    /// ENTER while a non-flat position exists.
    AlreadyInPosition,
    /// ADD with no open position.
    NoPosition,
    /// ADD was already used for this symbol today.
    AddAlreadyUsed,
    /// ADD while the market is not above the average entry price.
    NotInProfit,
    /// Confirmatory source fired without prior corroboration.
    AwaitingConfirmation,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Admitted => "admitted",
            Admission::Blocked { .. } => "blocked",
            Admission::AlreadyInPosition => "already_in_position",
            Admission::NoPosition => "no_position",
            Admission::AddAlreadyUsed => "add_already_used",
            Admission::NotInProfit => "not_in_profit",
            Admission::AwaitingConfirmation => "awaiting_confirmation",
        }
    }
}

impl std::fmt::Display for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable per-symbol session state.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SymbolSession {
    pub loss_count: u32,
    pub add_used: bool,
    pub first_trade_done: bool,
    pub scalper_confirmed: bool,
    pub awaiting_secondary: bool,
}

/// Admission-control gate over per-symbol session records.
#[derive(Debug)]
pub struct SessionGate {
    config: SessionConfig,
    records: DashMap<String, SymbolSession>,
}

impl SessionGate {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Record that a source fired for a symbol, before any admission
    /// check. A corroborating source confirms the symbol and clears
    /// any pending secondary wait.
    pub fn note_source_fired(&self, symbol: &str, source: SignalSource) {
        if source.is_corroborating() {
            let mut record = self.records.entry(symbol.to_string()).or_default();
            if !record.scalper_confirmed || record.awaiting_secondary {
                debug!(symbol = %symbol, source = %source, "Corroborating source fired");
            }
            record.scalper_confirmed = true;
            record.awaiting_secondary = false;
        }
    }

    /// Admission check for an ENTER signal.
    pub fn admit_enter(&self, symbol: &str, source: SignalSource, position_open: bool) -> Admission {
        let record = self.record(symbol);

        if record.loss_count >= self.config.loss_cap {
            return Admission::Blocked {
                loss_count: record.loss_count,
            };
        }
        if position_open {
            return Admission::AlreadyInPosition;
        }
        if self.config.require_confirmation
            && source.needs_confirmation()
            && !record.scalper_confirmed
            && (record.first_trade_done || record.awaiting_secondary)
        {
            return Admission::AwaitingConfirmation;
        }

        Admission::Admitted
    }

    /// Admission check for an ADD signal.
    ///
    /// `market_price` of `None` means the current price is unknown;
    /// an add cannot be shown to be in profit, so it is refused.
    pub fn admit_add(
        &self,
        symbol: &str,
        position_quantity: Decimal,
        avg_entry_price: Decimal,
        market_price: Option<Decimal>,
    ) -> Admission {
        let record = self.record(symbol);

        if record.loss_count >= self.config.loss_cap {
            return Admission::Blocked {
                loss_count: record.loss_count,
            };
        }
        if position_quantity <= Decimal::ZERO {
            return Admission::NoPosition;
        }
        if record.add_used {
            return Admission::AddAlreadyUsed;
        }
        match market_price {
            Some(price) if price > avg_entry_price => Admission::Admitted,
            _ => Admission::NotInProfit,
        }
    }

    /// Mark the first successful admission for a symbol.
    pub fn note_admitted(&self, symbol: &str) {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        record.first_trade_done = true;
    }

    /// An oversized or invalid first-of-session signal defers admission
    /// to a corroborating secondary source.
    pub fn note_first_rejected(&self, symbol: &str) {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        if !record.first_trade_done {
            record.awaiting_secondary = true;
            debug!(symbol = %symbol, "First signal rejected, awaiting secondary confirmation");
        }
    }

    /// Consume the one allowed add for a symbol.
    pub fn mark_add_used(&self, symbol: &str) {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        record.add_used = true;
    }

    /// Increment the loss count after a stop-triggered exit.
    ///
    /// Returns the new count.
    pub fn record_stop_loss(&self, symbol: &str) -> u32 {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        record.loss_count += 1;
        let count = record.loss_count;
        drop(record);
        if count >= self.config.loss_cap {
            info!(symbol = %symbol, loss_count = count, "Symbol locked out for the session");
        }
        count
    }

    /// Record a position flattening. Under the `on-flatten` reset
    /// policy a voluntary close clears the loss count.
    pub fn record_flatten(&self, symbol: &str, voluntary: bool) {
        if voluntary && self.config.loss_reset == LossResetPolicy::OnFlatten {
            let mut record = self.records.entry(symbol.to_string()).or_default();
            record.loss_count = 0;
        }
    }

    /// Daily reset boundary: every per-symbol record is cleared.
    pub fn daily_reset(&self) {
        let symbols = self.records.len();
        self.records.clear();
        info!(symbols, "Session state reset at daily boundary");
    }

    /// Current loss count for a symbol.
    pub fn loss_count(&self, symbol: &str) -> u32 {
        self.record(symbol).loss_count
    }

    /// Snapshot of a symbol's session record.
    pub fn session(&self, symbol: &str) -> SymbolSession {
        self.record(symbol)
    }

    /// All tracked symbols and their records, for status reporting.
    pub fn snapshot(&self) -> Vec<(String, SymbolSession)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn record(&self, symbol: &str) -> SymbolSession {
        self.records
            .get(symbol)
            .map(|r| *r.value())
            .unwrap_or_default()
    }
}
