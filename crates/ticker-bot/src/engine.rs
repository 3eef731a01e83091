//! Signal dispatch and execution orchestration.
//!
//! The engine owns every stateful component: the session gate, the
//! position book, the ledger and the gateway handle. Each inbound
//! signal is processed on its own task; a per-symbol async mutex
//! serializes signal handling and stop exits for the same symbol while
//! leaving different symbols fully concurrent.

use std::sync::Arc;

use chrono::Local;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::executor::entry::{EntryExecutor, EntryReport};
use crate::executor::exit::{ExitExecutor, ExitReport, ExitRequest};
use crate::gateway::{mark_price, BrokerGateway};
use crate::ledger::{ExitReason, Ledger, LedgerStats};
use crate::position::{Position, PositionBook, PositionState};
use crate::session::{Admission, SessionGate, SymbolSession};
use crate::signal::{Signal, SignalAction, SignalRejection};
use crate::stop::{StopCalculator, StopRejection};
use crate::watcher;

/// Terminal outcome of processing one signal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SignalOutcome {
    /// Field validation failed.
    Rejected { rejection: SignalRejection },
    /// The session gate refused the signal.
    NotAdmitted { admission: Admission },
    /// The stop calculator disqualified the signal candle.
    StopRejected { rejection: StopRejection },
    /// An entry chase achieved a fill and opened (or grew) a position.
    Entered { report: EntryReport },
    /// An add chase achieved a fill.
    Added { report: EntryReport },
    /// An entry or add chase ended with no fill.
    EntryAbandoned { report: EntryReport },
    /// An exit run finished.
    Exited { report: ExitReport },
    /// EXIT arrived with nothing to liquidate.
    NothingToExit,
}

/// Point-in-time view of the engine for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub positions: Vec<Position>,
    pub sessions: Vec<(String, SymbolSession)>,
    pub ledger: LedgerStats,
}

/// The execution engine.
pub struct Engine {
    config: BotConfig,
    gateway: Arc<dyn BrokerGateway>,
    gate: SessionGate,
    book: PositionBook,
    ledger: Ledger,
    stops: StopCalculator,
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(config: BotConfig, gateway: Arc<dyn BrokerGateway>) -> Arc<Self> {
        let gate = SessionGate::new(config.session.clone());
        let stops = StopCalculator::new(config.stop.clone());
        Arc::new(Self {
            config,
            gateway,
            gate,
            book: PositionBook::new(),
            ledger: Ledger::new(),
            stops,
            symbol_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn gateway(&self) -> &dyn BrokerGateway {
        self.gateway.as_ref()
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Process a signal on its own task.
    pub fn dispatch(self: &Arc<Self>, signal: Signal) -> JoinHandle<SignalOutcome> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.process_signal(signal).await })
    }

    /// Process one signal to a terminal outcome.
    pub async fn process_signal(self: Arc<Self>, signal: Signal) -> SignalOutcome {
        if let Err(rejection) = signal.validate() {
            warn!(symbol = %signal.symbol, action = %signal.action, rejection = %rejection, "Signal rejected");
            return SignalOutcome::Rejected { rejection };
        }

        // Source sequencing happens regardless of admission: a
        // corroborating source confirms the symbol even if this very
        // signal is later refused.
        self.gate.note_source_fired(&signal.symbol, signal.source);

        let lock = self.lock_for(&signal.symbol);
        let _guard = lock.lock().await;

        info!(
            symbol = %signal.symbol,
            action = %signal.action,
            source = %signal.source,
            quantity = %signal.quantity,
            reference_price = %signal.reference_price,
            "Processing signal"
        );

        match signal.action {
            SignalAction::Enter => self.handle_enter(&signal).await,
            SignalAction::Add => self.handle_add(&signal).await,
            SignalAction::Exit => self.handle_exit(&signal).await,
        }
    }

    async fn handle_enter(self: &Arc<Self>, signal: &Signal) -> SignalOutcome {
        let symbol = signal.symbol.as_str();

        let admission =
            self.gate
                .admit_enter(symbol, signal.source, self.book.is_active(symbol));
        if !admission.is_admitted() {
            info!(symbol = %symbol, admission = %admission, "Entry not admitted");
            return SignalOutcome::NotAdmitted { admission };
        }

        // Trend proximity: an entry priced too far from the strategy's
        // 20-EMA is an extended setup, skipped like any other
        // disqualified first signal.
        let max_distance = self.config.entry.max_ema_distance;
        if max_distance > Decimal::ZERO {
            if let Some(distance) = signal.trend_distance() {
                if distance > max_distance {
                    info!(
                        symbol = %symbol,
                        distance = %distance,
                        max_distance = %max_distance,
                        "Entry skipped, price extended from trend"
                    );
                    self.gate.note_first_rejected(symbol);
                    return SignalOutcome::Rejected {
                        rejection: SignalRejection::ExtendedFromTrend {
                            distance,
                            max_distance,
                        },
                    };
                }
            }
        }

        let stop = match self
            .stops
            .compute(&signal.candle, signal.volatility, Local::now().time())
        {
            Ok(stop) => stop,
            Err(rejection) => {
                info!(symbol = %symbol, rejection = %rejection, "Signal candle disqualified");
                self.gate.note_first_rejected(symbol);
                return SignalOutcome::StopRejected { rejection };
            }
        };

        if !self.book.try_begin_entry(symbol, signal.source, stop) {
            return SignalOutcome::NotAdmitted {
                admission: Admission::AlreadyInPosition,
            };
        }

        let executor = EntryExecutor::new(
            self.gateway.as_ref(),
            self.config.retry.clone(),
            self.config.entry.clone(),
        );
        let report = executor
            .execute(symbol, signal.quantity, signal.reference_price)
            .await;

        if report.filled > Decimal::ZERO {
            self.book
                .commit_entry(symbol, report.filled, report.avg_price);
            self.gate.note_admitted(symbol);
            watcher::spawn(Arc::clone(self), symbol.to_string());
            SignalOutcome::Entered { report }
        } else {
            self.book.abandon_entry(symbol);
            SignalOutcome::EntryAbandoned { report }
        }
    }

    async fn handle_add(self: &Arc<Self>, signal: &Signal) -> SignalOutcome {
        let symbol = signal.symbol.as_str();
        let position = self.book.get(symbol);
        let (held, avg_entry) = position
            .as_ref()
            .filter(|p| p.state == PositionState::Open)
            .map(|p| (p.quantity, p.avg_entry_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let mark = mark_price(self.gateway.as_ref(), symbol).await;
        let admission = self.gate.admit_add(symbol, held, avg_entry, mark);
        if !admission.is_admitted() {
            info!(symbol = %symbol, admission = %admission, "Add not admitted");
            return SignalOutcome::NotAdmitted { admission };
        }

        let executor = EntryExecutor::new(
            self.gateway.as_ref(),
            self.config.retry.clone(),
            self.config.entry.clone(),
        );
        let report = executor
            .execute(symbol, signal.quantity, signal.reference_price)
            .await;

        if report.filled > Decimal::ZERO {
            // Refresh totals from the brokerage: the add changed both
            // quantity and average entry.
            let (new_qty, new_avg) = match self.gateway.position(symbol).await {
                Ok(broker) => (broker.quantity, broker.avg_entry_price),
                Err(_) => (held + report.filled, avg_entry),
            };
            self.book.record_add(symbol, new_qty, new_avg);
            self.gate.mark_add_used(symbol);
            SignalOutcome::Added { report }
        } else {
            SignalOutcome::EntryAbandoned { report }
        }
    }

    async fn handle_exit(self: &Arc<Self>, signal: &Signal) -> SignalOutcome {
        let symbol = signal.symbol.as_str();

        if let Some(position) = self.book.begin_exit(symbol) {
            let request = ExitRequest {
                quantity_hint: signal.quantity,
                target: signal.exit_price,
                reason: ExitReason::Signal,
            };
            let report = self.run_exit(symbol, position.avg_entry_price, request).await;
            return SignalOutcome::Exited { report };
        }

        if self.book.state(symbol) == PositionState::Exiting {
            debug!(symbol = %symbol, "Exit already in flight");
            return SignalOutcome::NothingToExit;
        }

        // Orphan check: the brokerage may hold shares the book does not
        // know about (restart, manual trade). Liquidate them anyway,
        // reconstructing the entry price as best we can.
        let broker = self.gateway.position(symbol).await.unwrap_or_default();
        if broker.quantity > Decimal::ZERO {
            warn!(
                symbol = %symbol,
                quantity = %broker.quantity,
                "Exit for untracked brokerage position"
            );
            let entry_price = if broker.avg_entry_price > Decimal::ZERO {
                broker.avg_entry_price
            } else {
                self.ledger.last_entry_price(symbol).unwrap_or(Decimal::ZERO)
            };
            let request = ExitRequest {
                quantity_hint: signal.quantity,
                target: signal.exit_price,
                reason: ExitReason::Signal,
            };
            let report = self.run_exit(symbol, entry_price, request).await;
            return SignalOutcome::Exited { report };
        }

        debug!(symbol = %symbol, "Nothing to exit");
        SignalOutcome::NothingToExit
    }

    /// Watcher-triggered exit path (stop breach or trailing
    /// take-profit), called with the symbol lock NOT held.
    pub(crate) async fn trigger_watch_exit(self: &Arc<Self>, symbol: &str, reason: ExitReason) {
        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        // The trigger may have been handled by a signal exit while we
        // waited for the lock.
        let Some(position) = self.book.begin_exit(symbol) else {
            return;
        };
        let request = ExitRequest::full(None, reason);
        self.run_exit(symbol, position.avg_entry_price, request).await;
    }

    /// Run an exit and settle its consequences: ledger entry, book
    /// state, loss count.
    async fn run_exit(&self, symbol: &str, entry_price: Decimal, request: ExitRequest) -> ExitReport {
        let stop_triggered = request.reason == ExitReason::StopLoss;
        let executor = ExitExecutor::new(
            self.gateway.as_ref(),
            self.config.retry.clone(),
            self.config.exit.clone(),
        );
        let report = executor.execute(symbol, request).await;

        if report.exited > Decimal::ZERO {
            let reason = if report.used_fallback {
                ExitReason::Deadline
            } else {
                report.reason
            };
            self.ledger
                .record_exit(symbol, report.exited, entry_price, report.avg_exit_price, reason);
        }

        self.book.settle_exit(symbol, report.remaining);

        // Only a stop exit that actually sold counts toward the
        // lockout; a run that could not fill anything is retried by
        // the watcher, not punished.
        if stop_triggered && report.exited > Decimal::ZERO {
            let count = self.gate.record_stop_loss(symbol);
            debug!(symbol = %symbol, loss_count = count, "Stop loss recorded");
        } else if !stop_triggered && report.drained() {
            self.gate.record_flatten(symbol, true);
        }

        report
    }

    /// Daily boundary: clear session records.
    pub fn daily_reset(&self) {
        self.gate.daily_reset();
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            positions: self.book.snapshot(),
            sessions: self.gate.snapshot(),
            ledger: self.ledger.stats(),
        }
    }

    fn lock_for(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }
}
