//! Simulated brokerage for paper runs and tests.
//!
//! The paper gateway keeps an in-memory book per symbol: scriptable
//! quote/last-trade values, a held position, and a queue of fill
//! fractions applied to successive order submissions. Tests use the
//! fill plan to force full, partial or missed fills deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::debug;

use ticker_common::{OrderType, Side};

use super::{BrokerGateway, BrokerPosition, GatewayError, OrderRequest, OrderTicket, Quote};

/// Per-symbol simulated book.
#[derive(Debug, Default)]
struct SymbolBook {
    last_trade: Decimal,
    bid: Decimal,
    ask: Decimal,
    position_qty: Decimal,
    position_cost: Decimal,
    /// Fill fraction applied to the next submissions (empty = fill fully).
    fill_plan: VecDeque<Decimal>,
    /// Pending rejection reasons for the next submissions.
    reject_plan: VecDeque<String>,
    /// Every request this book has seen, for assertions.
    submissions: Vec<OrderRequest>,
}

impl SymbolBook {
    fn avg_entry_price(&self) -> Decimal {
        if self.position_qty > Decimal::ZERO {
            self.position_cost / self.position_qty
        } else {
            Decimal::ZERO
        }
    }
}

/// Simulated brokerage gateway.
#[derive(Debug, Default)]
pub struct PaperGateway {
    books: DashMap<String, SymbolBook>,
    open_orders: DashMap<String, OrderTicket>,
    order_counter: AtomicU64,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set best bid/ask for a symbol.
    pub fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.bid = bid;
        book.ask = ask;
    }

    /// Set the last trade price for a symbol.
    pub fn set_last_trade(&self, symbol: &str, price: Decimal) {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.last_trade = price;
    }

    /// Seed a held position directly.
    pub fn set_position(&self, symbol: &str, quantity: Decimal, avg_price: Decimal) {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.position_qty = quantity;
        book.position_cost = quantity * avg_price;
    }

    /// Queue a fill fraction for the next order submission.
    ///
    /// `1` fills fully, `0.6` fills 60%, `0` leaves the order resting
    /// unfilled. When the queue is empty submissions fill fully.
    pub fn push_fill_fraction(&self, symbol: &str, fraction: Decimal) {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.fill_plan.push_back(fraction);
    }

    /// Queue a rejection for the next order submission.
    pub fn push_rejection(&self, symbol: &str, reason: &str) {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.reject_plan.push_back(reason.to_string());
    }

    /// All requests submitted for a symbol, in order.
    pub fn submissions(&self, symbol: &str) -> Vec<OrderRequest> {
        self.books
            .get(symbol)
            .map(|book| book.submissions.clone())
            .unwrap_or_default()
    }

    /// Number of resting orders for a symbol.
    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.open_orders
            .iter()
            .filter(|entry| entry.value().symbol == symbol)
            .count()
    }

    fn next_order_id(&self) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst);
        format!("paper-{n}")
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn quote(&self, symbol: &str) -> Result<Quote, GatewayError> {
        // Unknown symbols report zero quotes; callers tolerate that.
        Ok(self
            .books
            .get(symbol)
            .map(|book| Quote {
                bid: book.bid,
                ask: book.ask,
            })
            .unwrap_or_default())
    }

    async fn last_trade(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        Ok(self
            .books
            .get(symbol)
            .map(|book| book.last_trade)
            .unwrap_or(Decimal::ZERO))
    }

    async fn position(&self, symbol: &str) -> Result<BrokerPosition, GatewayError> {
        Ok(self
            .books
            .get(symbol)
            .map(|book| BrokerPosition {
                quantity: book.position_qty,
                avg_entry_price: book.avg_entry_price(),
            })
            .unwrap_or_default())
    }

    async fn submit_order(&self, request: OrderRequest) -> Result<OrderTicket, GatewayError> {
        let mut book = self.books.entry(request.symbol.clone()).or_default();
        book.submissions.push(request.clone());

        if let Some(reason) = book.reject_plan.pop_front() {
            return Err(GatewayError::Rejected(reason));
        }

        let fill_price = match request.order_type {
            OrderType::Limit => request
                .limit_price
                .ok_or_else(|| GatewayError::Rejected("limit order without price".to_string()))?,
            OrderType::Market => {
                let mark = if book.last_trade > Decimal::ZERO {
                    book.last_trade
                } else if book.bid > Decimal::ZERO {
                    book.bid
                } else {
                    book.ask
                };
                if mark <= Decimal::ZERO {
                    return Err(GatewayError::Rejected(
                        "no market price available".to_string(),
                    ));
                }
                mark
            }
        };

        let fraction = book
            .fill_plan
            .pop_front()
            .unwrap_or(Decimal::ONE)
            .clamp(Decimal::ZERO, Decimal::ONE);
        let mut filled = request.quantity * fraction;

        match request.side {
            Side::Buy => {
                book.position_qty += filled;
                book.position_cost += filled * fill_price;
            }
            Side::Sell => {
                // Cannot sell more than held.
                filled = filled.min(book.position_qty);
                let avg = book.avg_entry_price();
                book.position_qty -= filled;
                book.position_cost -= filled * avg;
                if book.position_qty.is_zero() {
                    book.position_cost = Decimal::ZERO;
                }
            }
        }

        let ticket = OrderTicket {
            order_id: self.next_order_id(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            filled_quantity: filled,
            limit_price: request.limit_price,
            submitted_at: Utc::now(),
        };

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            quantity = %request.quantity,
            filled = %filled,
            price = %fill_price,
            "Paper order executed"
        );

        // A partially filled (or unfilled) order rests until cancelled.
        if ticket.remaining() > Decimal::ZERO {
            self.open_orders
                .insert(ticket.order_id.clone(), ticket.clone());
        }

        Ok(ticket)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.open_orders
            .remove(order_id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderTicket>, GatewayError> {
        Ok(self
            .open_orders
            .iter()
            .filter(|entry| entry.value().symbol == symbol)
            .map(|entry| entry.value().clone())
            .collect())
    }
}
