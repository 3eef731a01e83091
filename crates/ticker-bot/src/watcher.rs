//! Per-symbol position supervision.
//!
//! One watcher task runs per open symbol, polling the market price.
//! It triggers a stop exit when the price breaches the stop, and a
//! trailing take-profit exit when the price has fallen a configured
//! fraction from its peak since entry. The position book's watcher set
//! guarantees the task is a singleton per symbol; the task releases its
//! slot when the position goes flat. Nothing in the loop can panic
//! across the task boundary: every read failure is a skipped poll.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::gateway::mark_price;
use crate::ledger::ExitReason;
use crate::position::PositionState;

/// Spawn the watcher for a symbol if no watcher owns it yet.
///
/// Returns the task handle, or `None` when a watcher already exists.
pub fn spawn(engine: Arc<Engine>, symbol: String) -> Option<JoinHandle<()>> {
    if !engine.book().try_claim_watcher(&symbol) {
        debug!(symbol = %symbol, "Watcher already running");
        return None;
    }
    debug!(symbol = %symbol, "Watcher started");
    Some(tokio::spawn(watch(engine, symbol)))
}

async fn watch(engine: Arc<Engine>, symbol: String) {
    let poll = engine.config().watcher.poll_interval();
    let trail = engine.config().watcher.trail_drawdown;
    let mut peak = Decimal::ZERO;

    loop {
        tokio::time::sleep(poll).await;

        let Some(position) = engine.book().get(&symbol) else {
            break;
        };
        if position.quantity <= Decimal::ZERO {
            break;
        }
        // An exit is already in flight; check again next poll.
        if position.state != PositionState::Open {
            continue;
        }

        let Some(mark) = mark_price(engine.gateway(), &symbol).await else {
            debug!(symbol = %symbol, "No price this poll");
            continue;
        };
        peak = peak.max(mark);

        if mark <= position.stop_price {
            warn!(
                symbol = %symbol,
                mark = %mark,
                stop_price = %position.stop_price,
                "Stop breached"
            );
            engine.trigger_watch_exit(&symbol, ExitReason::StopLoss).await;
        } else if trail > Decimal::ZERO && mark <= peak * (Decimal::ONE - trail) {
            warn!(
                symbol = %symbol,
                mark = %mark,
                peak = %peak,
                trail = %trail,
                "Trailing take-profit triggered"
            );
            engine
                .trigger_watch_exit(&symbol, ExitReason::TrailingTake)
                .await;
        } else {
            continue;
        }

        // A remainder after the exit run reopens the position and
        // supervision continues; a clean drain ends the task.
        if !engine.book().is_active(&symbol) {
            break;
        }
    }

    engine.book().release_watcher(&symbol);
    debug!(symbol = %symbol, "Watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::gateway::paper::PaperGateway;
    use crate::signal::SignalSource;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn fast_engine(gateway: Arc<PaperGateway>) -> Arc<Engine> {
        let mut config = BotConfig::default();
        config.retry.settle_interval_ms = 5;
        config.exit.target_settle_ms = 5;
        config.exit.ladder_interval_ms = 5;
        config.exit.max_duration_ms = 500;
        config.watcher.poll_interval_ms = 5;
        Engine::new(config, gateway)
    }

    #[tokio::test]
    async fn test_watcher_exits_on_stop_breach() {
        let gateway = Arc::new(PaperGateway::new());
        let engine = fast_engine(gateway.clone());

        gateway.set_position("AAPL", dec!(100), dec!(10.00));
        engine
            .book()
            .try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.70));
        engine.book().commit_entry("AAPL", dec!(100), dec!(10.00));
        gateway.set_last_trade("AAPL", dec!(10.00));
        gateway.set_quote("AAPL", dec!(9.95), dec!(10.05));

        let handle = spawn(engine.clone(), "AAPL".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still above the stop: nothing sold.
        assert!(engine.book().is_active("AAPL"));

        // Breach.
        gateway.set_last_trade("AAPL", dec!(9.60));
        gateway.set_quote("AAPL", dec!(9.55), dec!(9.65));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher should finish after the breach exit")
            .unwrap();

        assert!(!engine.book().is_active("AAPL"));
        assert!(!engine.book().has_watcher("AAPL"));
        assert_eq!(engine.gate().loss_count("AAPL"), 1);
        let stats = engine.ledger().stats();
        assert_eq!(stats.trades, 1);
        assert_eq!(stats.wins, 0);
    }

    #[tokio::test]
    async fn test_trailing_take_profit_exits_above_the_stop() {
        let gateway = Arc::new(PaperGateway::new());
        let engine = fast_engine(gateway.clone());

        gateway.set_position("AAPL", dec!(100), dec!(10.00));
        engine
            .book()
            .try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.00));
        engine.book().commit_entry("AAPL", dec!(100), dec!(10.00));
        gateway.set_last_trade("AAPL", dec!(12.00));
        gateway.set_quote("AAPL", dec!(11.95), dec!(12.05));

        let handle = spawn(engine.clone(), "AAPL".to_string()).unwrap();
        // Let the watcher record the 12.00 peak.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.book().is_active("AAPL"));

        // 10.70 is a >10% drawdown from the peak but well above the
        // 9.00 stop.
        gateway.set_last_trade("AAPL", dec!(10.70));
        gateway.set_quote("AAPL", dec!(10.65), dec!(10.75));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher should finish after the trailing exit")
            .unwrap();

        assert!(!engine.book().is_active("AAPL"));
        // A take-profit is not a stop-out.
        assert_eq!(engine.gate().loss_count("AAPL"), 0);
        let entries = engine.ledger().entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_win());
    }

    #[tokio::test]
    async fn test_trailing_disabled_by_zero_drawdown() {
        let gateway = Arc::new(PaperGateway::new());
        let mut config = crate::config::BotConfig::default();
        config.watcher.poll_interval_ms = 5;
        config.watcher.trail_drawdown = rust_decimal::Decimal::ZERO;
        let engine = Engine::new(config, gateway.clone());

        gateway.set_position("AAPL", dec!(100), dec!(10.00));
        engine
            .book()
            .try_begin_entry("AAPL", SignalSource::Scalper, dec!(2.00));
        engine.book().commit_entry("AAPL", dec!(100), dec!(10.00));
        gateway.set_last_trade("AAPL", dec!(12.00));

        spawn(engine.clone(), "AAPL".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Halved from the peak, still above the stop: held.
        gateway.set_last_trade("AAPL", dec!(6.00));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.book().is_active("AAPL"));
        assert_eq!(engine.ledger().stats().trades, 0);
    }

    #[tokio::test]
    async fn test_watcher_stops_when_position_flattened_elsewhere() {
        let gateway = Arc::new(PaperGateway::new());
        let engine = fast_engine(gateway.clone());

        engine
            .book()
            .try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.70));
        engine.book().commit_entry("AAPL", dec!(100), dec!(10.00));

        let handle = spawn(engine.clone(), "AAPL".to_string()).unwrap();
        // Simulate a signal exit draining the book.
        engine.book().begin_exit("AAPL");
        engine.book().settle_exit("AAPL", Decimal::ZERO);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher should stop once the position is gone")
            .unwrap();
        assert!(!engine.book().has_watcher("AAPL"));
        // No stop loss was recorded.
        assert_eq!(engine.gate().loss_count("AAPL"), 0);
    }

    #[tokio::test]
    async fn test_second_spawn_is_refused() {
        let gateway = Arc::new(PaperGateway::new());
        let engine = fast_engine(gateway);

        engine
            .book()
            .try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.70));
        engine.book().commit_entry("AAPL", dec!(100), dec!(10.00));

        let first = spawn(engine.clone(), "AAPL".to_string());
        assert!(first.is_some());
        assert!(spawn(engine.clone(), "AAPL".to_string()).is_none());

        engine.book().begin_exit("AAPL");
        engine.book().settle_exit("AAPL", Decimal::ZERO);
        let _ = tokio::time::timeout(Duration::from_secs(2), first.unwrap()).await;
    }

    #[tokio::test]
    async fn test_missing_prices_never_trigger_an_exit() {
        let gateway = Arc::new(PaperGateway::new());
        let engine = fast_engine(gateway);

        engine
            .book()
            .try_begin_entry("AAPL", SignalSource::Scalper, dec!(9.70));
        engine.book().commit_entry("AAPL", dec!(100), dec!(10.00));

        spawn(engine.clone(), "AAPL".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // No quotes at all: the watcher just keeps polling.
        assert!(engine.book().is_active("AAPL"));
        assert_eq!(engine.ledger().stats().trades, 0);
    }
}
