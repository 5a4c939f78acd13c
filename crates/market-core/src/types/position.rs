//! Position tracking types for intraday option/equity positions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderSide;
use super::signal::{TradeCandidate, TrendDirection};
use super::trade::ExitSignal;

/// Which way the position profits.
///
/// Bought calls and bought puts are both `Long` on the option premium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side of the order that opens the position.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Side of the order that closes the position.
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Whether `trend` runs against a position held in this direction.
    pub fn is_reversed_by(&self, trend: TrendDirection) -> bool {
        matches!(
            (self, trend),
            (Self::Long, TrendDirection::Bearish) | (Self::Short, TrendDirection::Bullish)
        )
    }
}

/// Lifecycle phase of a position inside the exit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPhase {
    /// Monitoring; no adverse candle pending.
    Open,
    /// One or more consecutive closed candles at/beyond the stop while in loss.
    StopWarning,
    /// Profit crossed the breakeven trigger; the stop now trails.
    Trailing,
    /// An exit has been decided; values are frozen.
    Closed,
}

/// A live position owned by the risk engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Identifies this position instance (a re-entry gets a new id).
    pub id: Uuid,
    pub symbol: String,
    pub strategy: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: u32,
    pub initial_stop_loss: Decimal,
    pub current_stop_loss: Decimal,
    /// Best price seen since entry (highest for longs, lowest for shorts).
    pub highest_favorable_price: Decimal,
    pub entry_timestamp: DateTime<Utc>,
    pub entry_trend_strength: Option<f64>,
    pub phase: ExitPhase,
    /// Consecutive closed candles at/beyond the stop; frozen on close.
    pub consecutive_stop_warnings: u32,
    /// Timestamp of the last closed candle fed to the state machine.
    pub last_evaluated_candle: Option<DateTime<Utc>>,
    /// Frozen exit decision once `phase == Closed`.
    pub exit_signal: Option<ExitSignal>,
}

impl Position {
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        direction: Direction,
        entry_price: Decimal,
        quantity: u32,
        initial_stop_loss: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            strategy: strategy.into(),
            direction,
            entry_price,
            quantity,
            initial_stop_loss,
            current_stop_loss: initial_stop_loss,
            highest_favorable_price: entry_price,
            entry_timestamp: Utc::now(),
            entry_trend_strength: None,
            phase: ExitPhase::Open,
            consecutive_stop_warnings: 0,
            last_evaluated_candle: None,
            exit_signal: None,
        }
    }

    /// Open a position from a validated candidate at its expected fill.
    pub fn from_candidate(candidate: &TradeCandidate, default_stop_pct: Decimal) -> Self {
        let mut position = Self::new(
            candidate.symbol.clone(),
            candidate.strategy.clone(),
            candidate.direction,
            candidate.price,
            candidate.quantity,
            candidate.initial_stop(default_stop_pct),
        );
        position.entry_trend_strength = candidate.trend_strength.filter(|s| s.is_finite());
        position
    }

    /// Capital tied up by this position.
    pub fn value(&self) -> Decimal {
        self.entry_price * Decimal::from(self.quantity)
    }

    /// Signed profit percentage at `price` (negative when in loss).
    pub fn profit_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED * self.direction.sign()
    }

    /// Loss percentage at `price` (zero when in profit).
    pub fn loss_pct(&self, price: Decimal) -> Decimal {
        (-self.profit_pct(price)).max(Decimal::ZERO)
    }

    /// Realized P&L if closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * Decimal::from(self.quantity) * self.direction.sign()
    }

    /// Whether `price` is on the losing side of the entry.
    pub fn is_in_loss_at(&self, price: Decimal) -> bool {
        self.profit_pct(price) < Decimal::ZERO
    }

    /// Whether `price` has reached or crossed `stop` against the position.
    pub fn breaches(&self, price: Decimal, stop: Decimal) -> bool {
        match self.direction {
            Direction::Long => price <= stop,
            Direction::Short => price >= stop,
        }
    }

    /// The more favorable of two prices for this position.
    pub fn more_favorable(&self, a: Decimal, b: Decimal) -> Decimal {
        match self.direction {
            Direction::Long => a.max(b),
            Direction::Short => a.min(b),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ExitPhase::Closed
    }

    /// Freeze the position with its exit decision.
    ///
    /// Returns an error if an exit was already decided.
    pub fn mark_closed(&mut self, signal: ExitSignal) -> std::result::Result<(), String> {
        if self.is_closed() {
            return Err(format!(
                "Position {} ({}) is already closed",
                self.id, self.symbol
            ));
        }
        self.phase = ExitPhase::Closed;
        self.exit_signal = Some(signal);
        Ok(())
    }
}
