//! Portfolio-level risk bookkeeping for one trading day.

use chrono::{DateTime, NaiveDate, Utc};
use market_core::types::{Position, TradeRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::circuit_breaker::{CircuitBreakerState, KillSwitchState};

/// Day and week counters, open positions, blocks, and halt state.
///
/// `open_positions` is not serialized here; snapshots carry positions
/// separately and rebuild this map on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskState {
    /// Exchange-local date these counters belong to.
    pub trading_date: NaiveDate,
    pub daily_pnl: Decimal,
    pub weekly_pnl: Decimal,
    pub daily_trade_count: u32,
    pub weekly_trade_count: u32,
    pub daily_winners: u32,
    pub daily_losers: u32,
    pub strategy_trade_counts: BTreeMap<String, u32>,
    pub consecutive_losses: u32,
    /// Entry value of all open positions.
    pub capital_deployed: Decimal,
    #[serde(skip)]
    pub open_positions: BTreeMap<String, Position>,
    /// Symbol -> time the block expires.
    pub blocked_symbols: BTreeMap<String, DateTime<Utc>>,
    /// Stop-loss exits per symbol today.
    pub symbol_stop_losses: BTreeMap<String, u32>,
    pub circuit_breaker: CircuitBreakerState,
    pub kill_switch: KillSwitchState,
}

impl RiskState {
    pub fn new(trading_date: NaiveDate) -> Self {
        Self {
            trading_date,
            ..Default::default()
        }
    }

    /// Sum of entry values across open positions.
    pub fn open_positions_value(&self) -> Decimal {
        self.open_positions.values().map(Position::value).sum()
    }

    /// Recompute `capital_deployed` from the open positions.
    pub fn sync_capital_deployed(&mut self) {
        self.capital_deployed = self.open_positions_value();
    }

    pub fn is_blocked(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.blocked_symbols
            .get(symbol)
            .is_some_and(|until| now < *until)
    }

    /// Drop blocks that have expired, returning the freed symbols.
    pub fn prune_expired_blocks(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .blocked_symbols
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        for symbol in &expired {
            self.blocked_symbols.remove(symbol);
        }
        expired
    }

    /// Fold a closed trade into the day and week counters.
    pub fn record_trade(&mut self, trade: &TradeRecord) {
        self.daily_pnl += trade.pnl;
        self.weekly_pnl += trade.pnl;
        if trade.is_win() {
            self.daily_winners += 1;
            self.consecutive_losses = 0;
        } else {
            self.daily_losers += 1;
            self.consecutive_losses += 1;
        }
    }

    /// Start a new trading day.
    ///
    /// Weekly counters, blocked symbols, the breaker, and the kill switch
    /// carry over.
    pub fn reset_daily(&mut self, trading_date: NaiveDate) {
        self.trading_date = trading_date;
        self.daily_pnl = Decimal::ZERO;
        self.daily_trade_count = 0;
        self.daily_winners = 0;
        self.daily_losers = 0;
        self.strategy_trade_counts.clear();
        self.consecutive_losses = 0;
        self.open_positions.clear();
        self.capital_deployed = Decimal::ZERO;
        self.symbol_stop_losses.clear();
        self.circuit_breaker.reset_daily();
    }

    pub fn reset_weekly(&mut self) {
        self.weekly_pnl = Decimal::ZERO;
        self.weekly_trade_count = 0;
    }

    /// Consistency violations, empty when the state is sound.
    pub fn invariant_violations(&self, max_open_positions: usize) -> Vec<String> {
        let mut violations = Vec::new();
        if self.capital_deployed != self.open_positions_value() {
            violations.push(format!(
                "capital_deployed {} != open position value {}",
                self.capital_deployed,
                self.open_positions_value()
            ));
        }
        if self.open_positions.len() > max_open_positions {
            violations.push(format!(
                "{} open positions exceed limit {}",
                self.open_positions.len(),
                max_open_positions
            ));
        }
        for symbol in self.open_positions.keys() {
            if self.blocked_symbols.contains_key(symbol) {
                violations.push(format!("{} is both open and blocked", symbol));
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use market_core::types::{Direction, ExitReason};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn trade(pnl: i64) -> TradeRecord {
        let position = Position::new(
            "X",
            "NIFTYBOT",
            Direction::Long,
            Decimal::new(100, 0),
            1,
            Decimal::new(85, 0),
        );
        let exit = Decimal::new(100 + pnl, 0);
        TradeRecord::from_exit(&position, exit, ExitReason::Manual, "test", Utc::now())
    }

    #[test]
    fn test_record_trade_tracks_streaks() {
        let mut state = RiskState::new(date());
        state.record_trade(&trade(-10));
        state.record_trade(&trade(-5));
        assert_eq!(state.consecutive_losses, 2);
        assert_eq!(state.daily_pnl, Decimal::new(-15, 0));

        state.record_trade(&trade(20));
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.daily_winners, 1);
        assert_eq!(state.daily_losers, 2);
        assert_eq!(state.weekly_pnl, Decimal::new(5, 0));
    }

    #[test]
    fn test_reset_daily_keeps_weekly_and_blocks() {
        let now = Utc::now();
        let mut state = RiskState::new(date());
        state.record_trade(&trade(-50));
        state.daily_trade_count = 2;
        state.weekly_trade_count = 2;
        state
            .blocked_symbols
            .insert("X".to_string(), now + Duration::hours(2));

        state.reset_daily(date().succ_opt().unwrap());

        assert_eq!(state.daily_pnl, Decimal::ZERO);
        assert_eq!(state.daily_trade_count, 0);
        assert_eq!(state.weekly_pnl, Decimal::new(-50, 0));
        assert_eq!(state.weekly_trade_count, 2);
        assert!(state.is_blocked("X", now));
    }

    #[test]
    fn test_prune_expired_blocks() {
        let now = Utc::now();
        let mut state = RiskState::new(date());
        state.blocked_symbols.insert("OLD".to_string(), now);
        state
            .blocked_symbols
            .insert("NEW".to_string(), now + Duration::minutes(5));

        assert_eq!(state.prune_expired_blocks(now), vec!["OLD".to_string()]);
        assert!(state.is_blocked("NEW", now));
    }

    #[test]
    fn test_invariant_violations_detect_drift() {
        let mut state = RiskState::new(date());
        let position = Position::new(
            "X",
            "NIFTYBOT",
            Direction::Long,
            Decimal::new(100, 0),
            10,
            Decimal::new(85, 0),
        );
        state.open_positions.insert("X".to_string(), position);
        assert_eq!(state.invariant_violations(2).len(), 1);

        state.sync_capital_deployed();
        assert!(state.invariant_violations(2).is_empty());
    }
}
