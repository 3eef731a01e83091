//! Equity position execution and risk supervision.
//!
//! ticker-bot turns inbound strategy signals into supervised equity
//! positions: a session gate decides what may trade, a stop calculator
//! prices the downside, a chasing entry executor works the fill, a
//! per-symbol watcher polls for stop breaches, and a laddering exit
//! executor guarantees liquidation inside a hard deadline. Every
//! realized trade lands in an append-only ledger.

pub mod config;
pub mod engine;
pub mod executor;
pub mod gateway;
pub mod ledger;
pub mod position;
pub mod session;
pub mod signal;
pub mod stop;
pub mod watcher;

pub use config::BotConfig;
pub use engine::{Engine, EngineStatus, SignalOutcome};
pub use signal::{Signal, SignalAction, SignalSource};
