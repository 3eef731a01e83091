//! Configuration for ticker-bot.
//!
//! Supports loading from a TOML file with environment variable
//! overrides for credentials and CLI overrides for the run mode.
//! All execution parameters live here; the executors never hard-code
//! an interval or a threshold.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level configuration for ticker-bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Logging level.
    pub log_level: String,

    /// Brokerage connection parameters.
    pub broker: BrokerConfig,

    /// Stop calculator parameters.
    pub stop: StopConfig,

    /// Session gate parameters.
    pub session: SessionConfig,

    /// Shared retry policy for both executors.
    pub retry: RetryPolicy,

    /// Entry executor parameters.
    pub entry: EntryConfig,

    /// Exit executor parameters.
    pub exit: ExitConfig,

    /// Position watcher parameters.
    pub watcher: WatcherConfig,
}

/// Brokerage gateway connection parameters.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL of the brokerage API.
    pub base_url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://paper-api.example.com".to_string(),
        }
    }
}

/// Stop calculator parameters.
#[derive(Debug, Clone)]
pub struct StopConfig {
    /// Start of the open-auction window (exchange-local clock).
    pub open_auction_start: NaiveTime,
    /// End of the open-auction window.
    pub open_auction_end: NaiveTime,
    /// Volatility multiplier `k` applied inside the window.
    pub volatility_multiplier: Decimal,
    /// Maximum tolerated (close - low) / close for a signal candle.
    pub max_range_fraction: Decimal,
}

impl StopConfig {
    /// Whether `now` falls inside the open-auction window.
    pub fn in_open_auction(&self, now: NaiveTime) -> bool {
        now >= self.open_auction_start && now < self.open_auction_end
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            open_auction_start: hm(9, 30),
            open_auction_end: hm(9, 45),
            volatility_multiplier: Decimal::new(2, 0), // 2x
            max_range_fraction: Decimal::new(10, 2),   // 10%
        }
    }
}

/// How the per-symbol loss count resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossResetPolicy {
    /// Reset only at the daily boundary.
    DailyOnly,
    /// Also reset when a position is flattened voluntarily.
    OnFlatten,
}

impl LossResetPolicy {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "daily" | "daily-only" | "daily_only" => Some(LossResetPolicy::DailyOnly),
            "on-flatten" | "on_flatten" | "flatten" => Some(LossResetPolicy::OnFlatten),
            _ => None,
        }
    }
}

/// Session gate parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stop-loss count at which a symbol is locked out.
    pub loss_cap: u32,
    /// Enable cross-source confirmation sequencing.
    pub require_confirmation: bool,
    /// Loss-count reset policy.
    pub loss_reset: LossResetPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loss_cap: 2,
            require_confirmation: true,
            loss_reset: LossResetPolicy::DailyOnly,
        }
    }
}

/// Shared retry policy consumed by both the entry and exit executors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum order placement attempts before accepting the outcome.
    pub max_attempts: u32,
    /// Settle interval between placing an order and reading fills.
    pub settle_interval_ms: u64,
}

impl RetryPolicy {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            settle_interval_ms: 2000, // 2s
        }
    }
}

/// Entry executor parameters.
#[derive(Debug, Clone)]
pub struct EntryConfig {
    /// Fraction added to the target when pricing the limit buy.
    pub price_buffer: Decimal,
    /// Maximum tolerated distance between the reference price and the
    /// signal's trend average (20-EMA). Entries further from trend are
    /// skipped. Zero disables the check.
    pub max_ema_distance: Decimal,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            price_buffer: Decimal::new(3, 3),     // 0.3%
            max_ema_distance: Decimal::new(3, 2), // 3%
        }
    }
}

/// Exit executor parameters.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Settle interval after the phase-1 target attempt.
    pub target_settle_ms: u64,
    /// Sleep between ladder repricings.
    pub ladder_interval_ms: u64,
    /// Hard deadline for the aggressive ladder.
    pub max_duration_ms: u64,
    /// Discount applied to the deadline-fallback limit.
    pub fallback_discount: Decimal,
    /// Regular trading session open (exchange-local clock).
    pub regular_open: NaiveTime,
    /// Regular trading session close.
    pub regular_close: NaiveTime,
}

impl ExitConfig {
    pub fn target_settle(&self) -> Duration {
        Duration::from_millis(self.target_settle_ms)
    }

    pub fn ladder_interval(&self) -> Duration {
        Duration::from_millis(self.ladder_interval_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    /// Whether `now` falls inside regular trading hours.
    ///
    /// The deadline fallback only sends a market order inside this
    /// window; outside it a deeply discounted limit is used instead.
    pub fn in_regular_session(&self, now: NaiveTime) -> bool {
        now >= self.regular_open && now < self.regular_close
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            target_settle_ms: 6000,   // 6s
            ladder_interval_ms: 5000, // 5s
            max_duration_ms: 180_000, // 3 minutes
            fallback_discount: Decimal::new(5, 2), // 5%
            regular_open: hm(9, 30),
            regular_close: hm(16, 0),
        }
    }
}

/// Position watcher parameters.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Price poll interval.
    pub poll_interval_ms: u64,
    /// Trailing take-profit: exit when the price has fallen this
    /// fraction from its peak since entry. Zero disables trailing.
    pub trail_drawdown: Decimal,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,               // 2s
            trail_drawdown: Decimal::new(10, 2),  // 10%
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
            stop: StopConfig::default(),
            session: SessionConfig::default(),
            retry: RetryPolicy::default(),
            entry: EntryConfig::default(),
            exit: ExitConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Self::try_from_toml(file)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BROKER_BASE_URL") {
            self.broker.base_url = url;
        }
    }

    /// Apply CLI overrides.
    pub fn apply_cli_overrides(&mut self, log_level: Option<String>) {
        if let Some(level) = log_level {
            self.log_level = level;
        }
    }

    /// Validate parameter ranges that would make execution nonsensical.
    pub fn validate(&self) -> Result<()> {
        if self.session.loss_cap == 0 {
            bail!("session.loss_cap must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.stop.max_range_fraction <= Decimal::ZERO {
            bail!("stop.max_range_fraction must be positive");
        }
        if self.stop.volatility_multiplier < Decimal::ZERO {
            bail!("stop.volatility_multiplier must not be negative");
        }
        if self.exit.fallback_discount <= Decimal::ZERO || self.exit.fallback_discount >= Decimal::ONE {
            bail!("exit.fallback_discount must be between 0 and 1");
        }
        if self.entry.max_ema_distance < Decimal::ZERO {
            bail!("entry.max_ema_distance must not be negative");
        }
        if self.watcher.trail_drawdown < Decimal::ZERO || self.watcher.trail_drawdown >= Decimal::ONE {
            bail!("watcher.trail_drawdown must be in [0, 1)");
        }
        if self.stop.open_auction_end <= self.stop.open_auction_start {
            bail!("stop.open_auction_end must be after stop.open_auction_start");
        }
        Ok(())
    }

    fn try_from_toml(file: TomlConfig) -> Result<Self> {
        let config = Self {
            log_level: file.general.log_level,
            broker: BrokerConfig {
                base_url: file.broker.base_url,
            },
            stop: StopConfig {
                open_auction_start: parse_clock(&file.stop.open_auction_start)?,
                open_auction_end: parse_clock(&file.stop.open_auction_end)?,
                volatility_multiplier: f64_to_decimal(file.stop.volatility_multiplier),
                max_range_fraction: f64_to_decimal(file.stop.max_range_fraction),
            },
            session: SessionConfig {
                loss_cap: file.session.loss_cap,
                require_confirmation: file.session.require_confirmation,
                loss_reset: LossResetPolicy::from_str(&file.session.loss_reset)
                    .with_context(|| {
                        format!("unknown session.loss_reset: {}", file.session.loss_reset)
                    })?,
            },
            retry: RetryPolicy {
                max_attempts: file.retry.max_attempts,
                settle_interval_ms: file.retry.settle_interval_ms,
            },
            entry: EntryConfig {
                price_buffer: f64_to_decimal(file.entry.price_buffer),
                max_ema_distance: f64_to_decimal(file.entry.max_ema_distance),
            },
            exit: ExitConfig {
                target_settle_ms: file.exit.target_settle_ms,
                ladder_interval_ms: file.exit.ladder_interval_ms,
                max_duration_ms: file.exit.max_duration_ms,
                fallback_discount: f64_to_decimal(file.exit.fallback_discount),
                regular_open: parse_clock(&file.exit.regular_open)?,
                regular_close: parse_clock(&file.exit.regular_close)?,
            },
            watcher: WatcherConfig {
                poll_interval_ms: file.watcher.poll_interval_ms,
                trail_drawdown: f64_to_decimal(file.watcher.trail_drawdown),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Convert an f64 config value to Decimal, preserving the digits.
fn f64_to_decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
}

/// Parse an "HH:MM" clock string.
fn parse_clock(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .with_context(|| format!("invalid clock time (expected HH:MM): {s}"))
}

/// Build a NaiveTime for defaults where the arguments are known good.
fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

// =============================================================================
// Raw TOML shapes
// =============================================================================

#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    general: TomlGeneral,
    #[serde(default)]
    broker: TomlBroker,
    #[serde(default)]
    stop: TomlStop,
    #[serde(default)]
    session: TomlSession,
    #[serde(default)]
    retry: TomlRetry,
    #[serde(default)]
    entry: TomlEntry,
    #[serde(default)]
    exit: TomlExit,
    #[serde(default)]
    watcher: TomlWatcher,
}

#[derive(Debug, Deserialize)]
struct TomlGeneral {
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for TomlGeneral {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlBroker {
    #[serde(default = "default_base_url")]
    base_url: String,
}

impl Default for TomlBroker {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlStop {
    #[serde(default = "default_auction_start")]
    open_auction_start: String,
    #[serde(default = "default_auction_end")]
    open_auction_end: String,
    #[serde(default = "default_vol_mult")]
    volatility_multiplier: f64,
    #[serde(default = "default_max_range")]
    max_range_fraction: f64,
}

impl Default for TomlStop {
    fn default() -> Self {
        Self {
            open_auction_start: default_auction_start(),
            open_auction_end: default_auction_end(),
            volatility_multiplier: default_vol_mult(),
            max_range_fraction: default_max_range(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlSession {
    #[serde(default = "default_loss_cap")]
    loss_cap: u32,
    #[serde(default = "default_true")]
    require_confirmation: bool,
    #[serde(default = "default_loss_reset")]
    loss_reset: String,
}

impl Default for TomlSession {
    fn default() -> Self {
        Self {
            loss_cap: default_loss_cap(),
            require_confirmation: true,
            loss_reset: default_loss_reset(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlRetry {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_settle_ms")]
    settle_interval_ms: u64,
}

impl Default for TomlRetry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            settle_interval_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlEntry {
    #[serde(default = "default_price_buffer")]
    price_buffer: f64,
    #[serde(default = "default_max_ema_distance")]
    max_ema_distance: f64,
}

impl Default for TomlEntry {
    fn default() -> Self {
        Self {
            price_buffer: default_price_buffer(),
            max_ema_distance: default_max_ema_distance(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlExit {
    #[serde(default = "default_target_settle_ms")]
    target_settle_ms: u64,
    #[serde(default = "default_ladder_ms")]
    ladder_interval_ms: u64,
    #[serde(default = "default_exit_duration_ms")]
    max_duration_ms: u64,
    #[serde(default = "default_fallback_discount")]
    fallback_discount: f64,
    #[serde(default = "default_regular_open")]
    regular_open: String,
    #[serde(default = "default_regular_close")]
    regular_close: String,
}

impl Default for TomlExit {
    fn default() -> Self {
        Self {
            target_settle_ms: default_target_settle_ms(),
            ladder_interval_ms: default_ladder_ms(),
            max_duration_ms: default_exit_duration_ms(),
            fallback_discount: default_fallback_discount(),
            regular_open: default_regular_open(),
            regular_close: default_regular_close(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TomlWatcher {
    #[serde(default = "default_poll_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_trail_drawdown")]
    trail_drawdown: f64,
}

impl Default for TomlWatcher {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_ms(),
            trail_drawdown: default_trail_drawdown(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_url() -> String {
    "https://paper-api.example.com".to_string()
}
fn default_auction_start() -> String {
    "09:30".to_string()
}
fn default_auction_end() -> String {
    "09:45".to_string()
}
fn default_vol_mult() -> f64 {
    2.0
}
fn default_max_range() -> f64 {
    0.10
}
fn default_loss_cap() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_loss_reset() -> String {
    "daily".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_settle_ms() -> u64 {
    2000
}
fn default_price_buffer() -> f64 {
    0.003
}
fn default_max_ema_distance() -> f64 {
    0.03
}
fn default_target_settle_ms() -> u64 {
    6000
}
fn default_ladder_ms() -> u64 {
    5000
}
fn default_exit_duration_ms() -> u64 {
    180_000
}
fn default_fallback_discount() -> f64 {
    0.05
}
fn default_regular_open() -> String {
    "09:30".to_string()
}
fn default_regular_close() -> String {
    "16:00".to_string()
}
fn default_poll_ms() -> u64 {
    2000
}
fn default_trail_drawdown() -> f64 {
    0.10
}
