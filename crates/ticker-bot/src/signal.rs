//! Inbound trade signals.
//!
//! A signal is an immutable, consume-once instruction produced by an
//! upstream strategy. Transport and authentication happen before this
//! layer; by the time a `Signal` exists the payload has already been
//! parsed. Field validation still happens here because a malformed
//! signal is a structured rejection, never an error.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ticker_common::Candle;

/// What the signal asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    /// Open a new position.
    Enter,
    /// Add to an existing, in-profit position (once per session).
    Add,
    /// Close the position.
    Exit,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalAction::Enter => write!(f, "ENTER"),
            SignalAction::Add => write!(f, "ADD"),
            SignalAction::Exit => write!(f, "EXIT"),
        }
    }
}

/// Which upstream strategy produced the signal.
///
/// The session gate's cross-source sequencing keys off the class of
/// the source: scalper signals corroborate, momentum signals require
/// corroboration once the first trade of the session is done, manual
/// signals bypass sequencing entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Scalper,
    Momentum,
    Manual,
}

impl SignalSource {
    /// Sources whose firing clears `awaiting_secondary` and sets
    /// `scalper_confirmed` for the symbol.
    pub fn is_corroborating(&self) -> bool {
        matches!(self, SignalSource::Scalper)
    }

    /// Sources that may only enter after corroboration.
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, SignalSource::Momentum)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Scalper => "scalper",
            SignalSource::Momentum => "momentum",
            SignalSource::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An inbound trade signal. Consumed once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Equity symbol, e.g. "AAPL".
    pub symbol: String,
    /// Enter, add or exit.
    pub action: SignalAction,
    /// Upstream strategy that fired.
    pub source: SignalSource,
    /// Requested share quantity (for EXIT, zero means "whole position").
    pub quantity: Decimal,
    /// Reference price the strategy saw when it fired.
    pub reference_price: Decimal,
    /// Reference candle used for stop placement and range validation.
    pub candle: Candle,
    /// Optional volatility measure (e.g. ATR) for open-auction stops.
    #[serde(default)]
    pub volatility: Option<Decimal>,
    /// Optional trend average (20-EMA) carried by the strategy; an
    /// entry priced too far from it is skipped.
    #[serde(default)]
    pub ema20: Option<Decimal>,
    /// Optional explicit exit target for EXIT signals.
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    /// When the signal was accepted by the transport layer.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// Why a signal failed field validation.
///
/// These are structured non-error outcomes; they surface in the
/// dispatch result, not as a raised error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SignalRejection {
    EmptySymbol,
    NonPositiveQuantity,
    NonPositivePrice,
    InvalidCandle,
    /// Reference price too far from the signal's trend average.
    ExtendedFromTrend {
        distance: Decimal,
        max_distance: Decimal,
    },
}

impl std::fmt::Display for SignalRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalRejection::EmptySymbol => write!(f, "empty symbol"),
            SignalRejection::NonPositiveQuantity => write!(f, "quantity must be positive"),
            SignalRejection::NonPositivePrice => write!(f, "reference price must be positive"),
            SignalRejection::InvalidCandle => write!(f, "reference candle is malformed"),
            SignalRejection::ExtendedFromTrend {
                distance,
                max_distance,
            } => write!(
                f,
                "price is {distance} away from trend, maximum {max_distance}"
            ),
        }
    }
}

impl Signal {
    /// Validate the fields needed by the requested action.
    ///
    /// EXIT signals tolerate a zero quantity (meaning the full
    /// position) and do not require a well-formed candle.
    pub fn validate(&self) -> Result<(), SignalRejection> {
        if self.symbol.trim().is_empty() {
            return Err(SignalRejection::EmptySymbol);
        }
        if self.reference_price <= Decimal::ZERO {
            return Err(SignalRejection::NonPositivePrice);
        }
        match self.action {
            SignalAction::Enter | SignalAction::Add => {
                if self.quantity <= Decimal::ZERO {
                    return Err(SignalRejection::NonPositiveQuantity);
                }
                if !self.candle.is_valid() {
                    return Err(SignalRejection::InvalidCandle);
                }
            }
            SignalAction::Exit => {
                if self.quantity < Decimal::ZERO {
                    return Err(SignalRejection::NonPositiveQuantity);
                }
            }
        }
        Ok(())
    }

    /// Fractional distance between the reference price and the trend
    /// average, when one was supplied.
    pub fn trend_distance(&self) -> Option<Decimal> {
        let ema = self.ema20.filter(|e| *e > Decimal::ZERO)?;
        Some(((self.reference_price - ema) / ema).abs())
    }
}
