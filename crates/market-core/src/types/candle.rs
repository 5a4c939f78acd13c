//! OHLC candle type.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLC bar for a fixed interval, stamped with its open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    pub fn new(
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            open,
            high,
            low,
            close,
            timestamp,
        }
    }

    /// A candle whose open/high/low/close are all the same price.
    pub fn flat(price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self::new(price, price, price, price, timestamp)
    }

    /// Sanity check: positive prices and a consistent high/low envelope.
    pub fn is_valid(&self) -> bool {
        self.low > Decimal::ZERO
            && self.high >= self.low
            && self.open >= self.low
            && self.open <= self.high
            && self.close >= self.low
            && self.close <= self.high
    }
}

/// Candle interval supported by the broker's historical-data endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleInterval {
    OneMinute,
    ThreeMinute,
    #[default]
    FiveMinute,
    FifteenMinute,
}

impl CandleInterval {
    pub fn minutes(&self) -> i64 {
        match self {
            Self::OneMinute => 1,
            Self::ThreeMinute => 3,
            Self::FiveMinute => 5,
            Self::FifteenMinute => 15,
        }
    }
}
