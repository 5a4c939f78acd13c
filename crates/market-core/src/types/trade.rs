//! Exit reasons and the closed-trade record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::{Direction, Position};

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Loss beyond the emergency threshold on last-traded price.
    EmergencyStop,
    /// Stop confirmed by consecutive candle closes.
    HiddenStopLoss,
    /// Profit target reached.
    ProfitTarget,
    /// Trend reversed while in strong-trend mode.
    TrendFlip,
    /// Trailing stop breached.
    TrailingStop,
    /// Fixed stop breached on last-traded price.
    StopLoss,
    /// Operator-initiated exit.
    Manual,
    /// Square-off at the end of the session.
    EndOfSession,
}

impl ExitReason {
    /// Exits that count toward blocking a symbol after repeated stop-outs.
    pub fn is_stop_loss(&self) -> bool {
        matches!(
            self,
            Self::EmergencyStop | Self::HiddenStopLoss | Self::StopLoss
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::HiddenStopLoss => "HIDDEN_STOP_LOSS",
            Self::ProfitTarget => "PROFIT_TARGET",
            Self::TrendFlip => "TREND_FLIP",
            Self::TrailingStop => "TRAILING_STOP",
            Self::StopLoss => "STOP_LOSS",
            Self::Manual => "MANUAL",
            Self::EndOfSession => "END_OF_SESSION",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decided exit: the price to exit at and a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub price: Decimal,
    pub reason: ExitReason,
    pub message: String,
    pub decided_at: DateTime<Utc>,
}

impl ExitSignal {
    pub fn new(price: Decimal, reason: ExitReason, message: impl Into<String>) -> Self {
        Self {
            price,
            reason,
            message: message.into(),
            decided_at: Utc::now(),
        }
    }
}

/// Immutable record of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: Uuid,
    pub symbol: String,
    pub strategy: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: u32,
    pub pnl: Decimal,
    /// P&L as a percentage of entry value (e.g. 12.5 = +12.5%).
    pub pnl_percent: Decimal,
    pub exit_reason: ExitReason,
    pub exit_message: String,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_timestamp: DateTime<Utc>,
}

impl TradeRecord {
    /// Build the record for `position` closed at `exit_price`.
    pub fn from_exit(
        position: &Position,
        exit_price: Decimal,
        reason: ExitReason,
        message: impl Into<String>,
        exit_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id: position.id,
            symbol: position.symbol.clone(),
            strategy: position.strategy.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl: position.pnl_at(exit_price),
            pnl_percent: position.profit_pct(exit_price).round_dp(4),
            exit_reason: reason,
            exit_message: message.into(),
            entry_timestamp: position.entry_timestamp,
            exit_timestamp,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}
