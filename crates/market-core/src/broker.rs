//! Broker collaborator contract and an in-memory paper implementation.
//!
//! The engine only consumes this trait; the live adapter (quotes, candles,
//! order placement, instrument lookup) lives outside this workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{Candle, CandleInterval, OrderSide, TrendDirection};
use crate::{Error, Result};

/// Market data and execution calls the engine depends on.
///
/// Every call is fallible; callers must treat an error as "no new
/// information", never as an implicit fill or exit.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Last traded price for `symbol`.
    async fn get_last_price(&self, symbol: &str) -> Result<Decimal>;

    /// Most recent `count` completed candles, oldest first.
    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: usize,
        interval: CandleInterval,
    ) -> Result<Vec<Candle>>;

    /// Place a market order and return the broker's order id.
    async fn place_order(&self, symbol: &str, side: OrderSide, quantity: u32) -> Result<String>;

    /// Trend strength score (e.g. ADX) for `symbol`.
    async fn get_signal_strength(&self, symbol: &str) -> Result<f64>;

    /// Current trend direction (e.g. Supertrend) for `symbol`.
    async fn get_trend_direction(&self, symbol: &str) -> Result<TrendDirection>;
}

/// A simulated fill recorded by [`PaperBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PaperMarket {
    prices: HashMap<String, Decimal>,
    candles: HashMap<String, Vec<Candle>>,
    strength: HashMap<String, f64>,
    trend: HashMap<String, TrendDirection>,
    fills: Vec<PaperFill>,
    failing_symbols: HashMap<String, String>,
    reject_orders: bool,
}

/// In-memory broker for paper trading and tests.
///
/// Orders fill immediately at the last set price.
#[derive(Debug, Default)]
pub struct PaperBroker {
    market: RwLock<PaperMarket>,
    next_order_id: AtomicU64,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.market
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    /// Append a completed candle for `symbol`.
    pub async fn push_candle(&self, symbol: &str, candle: Candle) {
        self.market
            .write()
            .await
            .candles
            .entry(symbol.to_string())
            .or_default()
            .push(candle);
    }

    pub async fn set_signal_strength(&self, symbol: &str, strength: f64) {
        self.market
            .write()
            .await
            .strength
            .insert(symbol.to_string(), strength);
    }

    pub async fn set_trend(&self, symbol: &str, trend: TrendDirection) {
        self.market
            .write()
            .await
            .trend
            .insert(symbol.to_string(), trend);
    }

    /// Make every market-data call for `symbol` fail with `message`.
    pub async fn fail_symbol(&self, symbol: &str, message: &str) {
        self.market
            .write()
            .await
            .failing_symbols
            .insert(symbol.to_string(), message.to_string());
    }

    pub async fn restore_symbol(&self, symbol: &str) {
        self.market.write().await.failing_symbols.remove(symbol);
    }

    /// Reject every subsequent order.
    pub async fn set_reject_orders(&self, reject: bool) {
        self.market.write().await.reject_orders = reject;
    }

    /// Fills recorded so far, oldest first.
    pub async fn fills(&self) -> Vec<PaperFill> {
        self.market.read().await.fills.clone()
    }

    async fn check_symbol(&self, symbol: &str) -> Result<()> {
        match self.market.read().await.failing_symbols.get(symbol) {
            Some(message) => Err(Error::broker(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_last_price(&self, symbol: &str) -> Result<Decimal> {
        self.check_symbol(symbol).await?;
        self.market
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::broker(format!("No quote for {}", symbol)))
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: usize,
        _interval: CandleInterval,
    ) -> Result<Vec<Candle>> {
        self.check_symbol(symbol).await?;
        let market = self.market.read().await;
        let candles = market.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(count);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn place_order(&self, symbol: &str, side: OrderSide, quantity: u32) -> Result<String> {
        let mut market = self.market.write().await;
        if market.reject_orders {
            return Err(Error::OrderRejected {
                message: format!("{} {} {}", side, quantity, symbol),
            });
        }
        if let Some(message) = market.failing_symbols.get(symbol) {
            return Err(Error::broker(message.clone()));
        }
        let price = market
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::broker(format!("No quote for {}", symbol)))?;

        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("PAPER-{:06}", id);
        market.fills.push(PaperFill {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            filled_at: Utc::now(),
        });

        info!(
            order_id = %order_id,
            symbol = symbol,
            side = %side,
            quantity = quantity,
            price = %price,
            "Paper order filled"
        );
        Ok(order_id)
    }

    async fn get_signal_strength(&self, symbol: &str) -> Result<f64> {
        self.check_symbol(symbol).await?;
        let strength = self
            .market
            .read()
            .await
            .strength
            .get(symbol)
            .copied()
            .unwrap_or(f64::NAN);
        debug!(symbol = symbol, strength = strength, "Paper signal strength");
        Ok(strength)
    }

    async fn get_trend_direction(&self, symbol: &str) -> Result<TrendDirection> {
        self.check_symbol(symbol).await?;
        self.market
            .read()
            .await
            .trend
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::broker(format!("No trend data for {}", symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paper_order_fills_at_last_price() {
        let broker = PaperBroker::new();
        broker.set_price("NIFTY24500CE", Decimal::new(120, 0)).await;

        let order_id = broker
            .place_order("NIFTY24500CE", OrderSide::Buy, 75)
            .await
            .unwrap();
        assert_eq!(order_id, "PAPER-000001");

        let fills = broker.fills().await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, Decimal::new(120, 0));
        assert_eq!(fills[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_recent_candles_returns_tail() {
        let broker = PaperBroker::new();
        let now = Utc::now();
        for i in 0..5 {
            broker
                .push_candle(
                    "X",
                    Candle::flat(Decimal::from(100 + i), now + chrono::Duration::minutes(i)),
                )
                .await;
        }

        let candles = broker
            .get_recent_candles("X", 2, CandleInterval::FiveMinute)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, Decimal::from(104));
    }

    #[tokio::test]
    async fn test_rejected_order_is_not_transient() {
        let broker = PaperBroker::new();
        broker.set_price("X", Decimal::ONE).await;
        broker.set_reject_orders(true).await;

        let err = broker.place_order("X", OrderSide::Sell, 1).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(broker.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_symbol_errors() {
        let broker = PaperBroker::new();
        broker.set_price("X", Decimal::ONE).await;
        broker.fail_symbol("X", "connection reset").await;

        let err = broker.get_last_price("X").await.unwrap_err();
        assert!(err.is_transient());

        broker.restore_symbol("X").await;
        assert_eq!(broker.get_last_price("X").await.unwrap(), Decimal::ONE);
    }
}
