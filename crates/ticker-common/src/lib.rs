//! Shared types for the ticker execution engine.
//!
//! This crate contains the wire-level vocabulary used by both the
//! brokerage gateway and the execution engine:
//! - Order primitives (Side, OrderType, TimeInForce)
//! - The reference candle carried by inbound signals

pub mod types;

pub use types::*;
