//! Entry candidates produced by strategy bots.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Direction;

/// Trend direction reported by the indicator source (e.g. Supertrend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Bullish,
    Bearish,
}

/// A proposed entry awaiting risk validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCandidate {
    pub symbol: String,
    /// Originating strategy/bot, used for per-strategy trade caps.
    pub strategy: String,
    pub direction: Direction,
    /// Expected fill price.
    pub price: Decimal,
    pub quantity: u32,
    /// Planned initial stop; `None` means "use the configured default width".
    pub stop_loss: Option<Decimal>,
    /// Trend strength (e.g. ADX) observed at signal time.
    pub trend_strength: Option<f64>,
}

impl TradeCandidate {
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        direction: Direction,
        price: Decimal,
        quantity: u32,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            strategy: strategy.into(),
            direction,
            price,
            quantity,
            stop_loss: None,
            trend_strength: None,
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_trend_strength(mut self, strength: f64) -> Self {
        self.trend_strength = Some(strength);
        self
    }

    /// Notional value of the entry.
    pub fn value(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    /// Width of the planned stop as a percentage of the entry price.
    ///
    /// Falls back to `default_pct` when no stop was supplied or the price is
    /// not positive.
    pub fn stop_loss_percent(&self, default_pct: Decimal) -> Decimal {
        match self.stop_loss {
            Some(stop) if self.price > Decimal::ZERO => {
                ((self.price - stop) / self.price * Decimal::ONE_HUNDRED).abs()
            }
            _ => default_pct.abs(),
        }
    }

    /// Whether the supplied stop sits on the losing side of the entry.
    ///
    /// Below the price for longs, above it for shorts. A missing stop counts
    /// as valid since the default width is applied in the right direction.
    pub fn stop_on_loss_side(&self) -> bool {
        match (self.stop_loss, self.direction) {
            (None, _) => true,
            (Some(stop), Direction::Long) => stop < self.price,
            (Some(stop), Direction::Short) => stop > self.price,
        }
    }

    /// The initial stop price, deriving it from `default_pct` if absent.
    pub fn initial_stop(&self, default_pct: Decimal) -> Decimal {
        self.stop_loss.unwrap_or_else(|| {
            let offset = self.price * default_pct / Decimal::ONE_HUNDRED;
            match self.direction {
                Direction::Long => self.price - offset,
                Direction::Short => self.price + offset,
            }
        })
    }
}
