//! Configuration management for the intraday trading bot.
//!
//! Values come from an optional config file (`RISK_CONFIG_FILE`) layered
//! under `BOT__`-prefixed environment variables, e.g.
//! `BOT__LIMITS__MAX_LOSS_PER_DAY=7500`.

use crate::types::CandleInterval;
use crate::{Error, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: RiskLimits,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Portfolio-level risk thresholds. Immutable for the duration of a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_loss_per_day: Decimal,
    /// Stop taking new entries once the day is this far in profit.
    pub max_profit_per_day: Option<Decimal>,
    pub max_loss_per_week: Decimal,
    pub max_trades_per_day: u32,
    /// Per-strategy daily trade caps keyed by strategy name.
    pub strategy_trade_limits: HashMap<String, u32>,
    /// Cap for strategies not listed in `strategy_trade_limits`.
    pub default_strategy_trade_limit: Option<u32>,
    pub max_consecutive_losses: u32,
    pub max_position_value: Decimal,
    pub min_position_value: Decimal,
    pub max_order_value: Decimal,
    pub max_capital_deployed: Decimal,
    pub max_open_positions: usize,
    /// Widest acceptable initial stop, in percent of entry.
    pub max_stop_loss_percent: Decimal,
    /// Stop width assumed when a candidate carries no stop.
    pub default_stop_loss_percent: Decimal,
    pub cool_off_minutes_after_loss: i64,
    /// Stop-loss exits on one symbol (same day) before it is blocked.
    pub symbol_block_after_stop_losses: u32,
    pub symbol_block_minutes: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        let mut strategy_trade_limits = HashMap::new();
        strategy_trade_limits.insert("NIFTYBOT".to_string(), 2);
        strategy_trade_limits.insert("BANKNIFTYBOT".to_string(), 2);

        Self {
            max_loss_per_day: Decimal::new(5000, 0),
            max_profit_per_day: Some(Decimal::new(15000, 0)),
            max_loss_per_week: Decimal::new(15000, 0),
            max_trades_per_day: 3,
            strategy_trade_limits,
            default_strategy_trade_limit: None,
            max_consecutive_losses: 2,
            max_position_value: Decimal::new(30000, 0),
            min_position_value: Decimal::new(10000, 0),
            max_order_value: Decimal::new(50000, 0),
            max_capital_deployed: Decimal::new(50000, 0),
            max_open_positions: 2,
            max_stop_loss_percent: Decimal::new(20, 0),
            default_stop_loss_percent: Decimal::new(15, 0),
            cool_off_minutes_after_loss: 60,
            symbol_block_after_stop_losses: 2,
            symbol_block_minutes: 120,
        }
    }
}

impl RiskLimits {
    /// Daily cap for `strategy`, if any.
    pub fn strategy_limit(&self, strategy: &str) -> Option<u32> {
        self.strategy_trade_limits
            .get(strategy)
            .copied()
            .or(self.default_strategy_trade_limit)
    }

    /// Reject internally inconsistent limits before a session starts.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Error::Config {
            message: message.to_string(),
        };
        if self.max_loss_per_day <= Decimal::ZERO || self.max_loss_per_week <= Decimal::ZERO {
            return Err(invalid("loss limits must be positive"));
        }
        if self.min_position_value > self.max_position_value {
            return Err(invalid("min_position_value exceeds max_position_value"));
        }
        if self.max_open_positions == 0 {
            return Err(invalid("max_open_positions must be at least 1"));
        }
        if self.max_stop_loss_percent <= Decimal::ZERO
            || self.max_stop_loss_percent >= Decimal::ONE_HUNDRED
        {
            return Err(invalid("max_stop_loss_percent must be within (0, 100)"));
        }
        if self.cool_off_minutes_after_loss < 0 || self.symbol_block_minutes < 0 {
            return Err(invalid("cool-off durations cannot be negative"));
        }
        Ok(())
    }
}

/// Trailing parameters for one trend regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingParams {
    /// Peak profit (percent) at which the stop moves to breakeven.
    pub breakeven_trigger_pct: Decimal,
    /// Each full step of profit beyond the trigger locks this much more.
    pub step_pct: Decimal,
    /// Fraction of the peak open profit that may be given back (0..1).
    pub max_giveback: Decimal,
}

/// Exit state machine thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub emergency_stop_pct: Decimal,
    pub profit_target_pct: Decimal,
    /// Confirm the stop on candle closes instead of last-traded price.
    pub confirm_stop_on_candle_close: bool,
    pub stop_confirmation_candles: u32,
    /// Trend strength (ADX) at or above which the strong-trend set applies.
    pub strong_trend_threshold: f64,
    pub strong_trend: TrailingParams,
    pub weak_trend: TrailingParams,
    pub trend_flip_exit_enabled: bool,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            emergency_stop_pct: Decimal::new(25, 0),
            profit_target_pct: Decimal::new(50, 0),
            confirm_stop_on_candle_close: true,
            stop_confirmation_candles: 2,
            strong_trend_threshold: 25.0,
            strong_trend: TrailingParams {
                breakeven_trigger_pct: Decimal::new(20, 0),
                step_pct: Decimal::new(10, 0),
                max_giveback: Decimal::new(5, 1),
            },
            weak_trend: TrailingParams {
                breakeven_trigger_pct: Decimal::new(10, 0),
                step_pct: Decimal::new(5, 0),
                max_giveback: Decimal::new(3, 1),
            },
            trend_flip_exit_enabled: true,
        }
    }
}

/// Where risk state is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_dir: PathBuf,
    pub state_file: String,
    /// Closed trades kept in memory for status display.
    pub trade_history_len: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data/risk"),
            state_file: "risk_state.json".to_string(),
            trade_history_len: 100,
        }
    }
}

impl PersistenceConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(&self.state_file)
    }
}

/// Control loop timing and external-call bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_secs: u64,
    pub candle_interval: CandleInterval,
    pub candle_lookback: usize,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            candle_interval: CandleInterval::FiveMinute,
            candle_lookback: 2,
            request_timeout_ms: 5000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 4000,
        }
    }
}

/// Exchange session calendar (defaults to NSE, UTC+05:30).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub utc_offset_minutes: i32,
    /// Local time after which all positions are squared off.
    pub square_off_time: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            square_off_time: NaiveTime::from_hms_opt(15, 15, 0).unwrap_or_default(),
        }
    }
}

impl SessionConfig {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Exchange-local calendar date of `now`.
    pub fn trading_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }

    /// Next exchange-local midnight after `now`, in UTC.
    pub fn end_of_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next_day = self.trading_date(now) + Duration::days(1);
        let midnight = next_day.and_time(NaiveTime::MIN);
        self.offset()
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now + Duration::hours(24))
    }

    /// Whether `now` is at or past the local square-off time.
    pub fn is_square_off_time(&self, now: DateTime<Utc>) -> bool {
        now.with_timezone(&self.offset()).time() >= self.square_off_time
    }
}

impl Config {
    /// Load configuration from `.env`, an optional file, and environment variables.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let file = env::var("RISK_CONFIG_FILE").ok().map(PathBuf::from);
        Self::load(file.as_deref())
    }

    /// Load configuration from `file` (if given) overlaid with `BOT__*` variables.
    #[allow(clippy::result_large_err)]
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("BOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.limits.validate()?;
        Ok(config)
    }

    /// Configuration for tests, persisting under `state_dir`.
    pub fn test_config(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            persistence: PersistenceConfig {
                state_dir: state_dir.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
