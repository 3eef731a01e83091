//! Brokerage gateway abstraction.
//!
//! The engine only ever talks to the brokerage through the
//! `BrokerGateway` trait: read a quote, read the last trade, read the
//! held position, submit/cancel orders. A paper implementation backs
//! tests and dry runs; a live adapter would wrap the real REST API
//! behind the same seam.
//!
//! Gateway reads are idempotent and side-effect free; callers need no
//! lock around them. Zero or missing quote values are valid results
//! and every caller must tolerate them.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use ticker_common::{OrderType, Side, TimeInForce};

/// Errors surfaced by gateway calls.
///
/// Inside executor loops these are all treated as "no progress this
/// attempt", never as fatal: the loop logs and continues up to its
/// bound.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("quote unavailable for {0}")]
    QuoteUnavailable(String),

    #[error("connection failed: {0}")]
    Connection(String),
}

/// Best bid/ask. Either side may legitimately be zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Held position as the brokerage reports it.
///
/// An absent position is the zero value, not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
}

/// Request to place an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Unique request id for tracking.
    pub request_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    /// Required for limit orders.
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub timestamp: DateTime<Utc>,
}

impl OrderRequest {
    /// Create a limit order request.
    pub fn limit(symbol: &str, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            time_in_force: TimeInForce::Day,
            timestamp: Utc::now(),
        }
    }

    /// Create a market order request.
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Day,
            timestamp: Utc::now(),
        }
    }
}

/// An order the brokerage has accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
}

impl OrderTicket {
    /// Remaining unfilled quantity.
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

/// The brokerage gateway seam.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Best bid/ask for a symbol. Zero values are valid.
    async fn quote(&self, symbol: &str) -> Result<Quote, GatewayError>;

    /// Price of the most recent trade.
    async fn last_trade(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    /// Held position; absent positions come back as zero.
    async fn position(&self, symbol: &str) -> Result<BrokerPosition, GatewayError>;

    /// Submit an order.
    ///
    /// # Errors
    ///
    /// Rejections (bad price, insufficient funds) come back as
    /// `GatewayError::Rejected` and are retryable from the caller's
    /// point of view.
    async fn submit_order(&self, request: OrderRequest) -> Result<OrderTicket, GatewayError>;

    /// Cancel an order by id.
    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    /// All open orders for a symbol.
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderTicket>, GatewayError>;
}

/// Best-effort mark price: last trade, else bid, else ask.
///
/// Returns `None` when no positive price is available; callers treat
/// that as "no progress this poll".
pub async fn mark_price(gateway: &dyn BrokerGateway, symbol: &str) -> Option<Decimal> {
    if let Ok(last) = gateway.last_trade(symbol).await {
        if last > Decimal::ZERO {
            return Some(last);
        }
    }
    if let Ok(quote) = gateway.quote(symbol).await {
        if quote.bid > Decimal::ZERO {
            return Some(quote.bid);
        }
        if quote.ask > Decimal::ZERO {
            return Some(quote.ask);
        }
    }
    None
}

/// Cancel every resting order for a symbol, best effort.
///
/// Cancel failures are logged and swallowed: the order may already be
/// filled or expired, which the caller discovers on its next position
/// read.
pub async fn cancel_all(gateway: &dyn BrokerGateway, symbol: &str) {
    let orders = match gateway.open_orders(symbol).await {
        Ok(orders) => orders,
        Err(e) => {
            debug!(symbol = %symbol, error = %e, "Failed to list open orders");
            return;
        }
    };
    for order in orders {
        match gateway.cancel_order(&order.order_id).await {
            Ok(()) => debug!(symbol = %symbol, order_id = %order.order_id, "Cancelled resting order"),
            Err(e) => {
                debug!(symbol = %symbol, order_id = %order.order_id, error = %e, "Failed to cancel order")
            }
        }
    }
}
