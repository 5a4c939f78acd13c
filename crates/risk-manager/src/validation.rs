//! Pre-trade validation chain.

use chrono::{DateTime, Duration, Utc};
use market_core::config::{RiskLimits, SessionConfig};
use market_core::types::TradeCandidate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::circuit_breaker::{KillReason, TripReason};
use crate::state::RiskState;

/// Why a candidate was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    KillSwitch,
    CircuitBreaker,
    DailyLossLimit,
    DailyProfitTarget,
    WeeklyLossLimit,
    DailyTradeLimit,
    StrategyTradeLimit,
    ConsecutiveLosses,
    InvalidCandidate,
    PositionTooSmall,
    PositionTooLarge,
    OrderValueTooLarge,
    CapitalDeploymentLimit,
    MaxOpenPositions,
    DuplicateSymbol,
    SymbolBlocked,
    StopLossTooWide,
    InsufficientCapital,
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TradeDecision {
    Approved,
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl TradeDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Approved => None,
            Self::Rejected { reason, .. } => Some(*reason),
        }
    }

    fn reject(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }
}

/// Run the ordered checks for `candidate`; the first failure wins.
///
/// Some checks halt trading as a side effect: a daily loss trips the
/// breaker until end of day, a weekly loss engages the kill switch, and a
/// losing streak trips the breaker for the cool-off window. Expired symbol
/// blocks are dropped on the way.
pub fn validate(
    state: &mut RiskState,
    limits: &RiskLimits,
    session: &SessionConfig,
    candidate: &TradeCandidate,
    available_capital: Decimal,
    now: DateTime<Utc>,
) -> TradeDecision {
    use RejectReason::*;

    // 1. Kill switch
    if state.kill_switch.active {
        let detail = state.kill_switch.message.clone().unwrap_or_default();
        return TradeDecision::reject(KillSwitch, format!("Kill switch active: {}", detail));
    }

    // 2. Circuit breaker
    if state.circuit_breaker.tripped {
        let detail = state.circuit_breaker.message.clone().unwrap_or_default();
        let resume = state
            .circuit_breaker
            .resume_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        return TradeDecision::reject(
            CircuitBreaker,
            format!("Circuit breaker active until {}: {}", resume, detail),
        );
    }

    // 3. Daily loss
    if state.daily_pnl <= -limits.max_loss_per_day {
        let message = format!(
            "Daily loss limit hit: {} (limit -{})",
            state.daily_pnl, limits.max_loss_per_day
        );
        warn!(daily_pnl = %state.daily_pnl, "Daily loss limit hit, halting until end of day");
        state.circuit_breaker.trip(
            TripReason::DailyLossLimit,
            message.clone(),
            now,
            session.end_of_day(now),
        );
        return TradeDecision::reject(DailyLossLimit, message);
    }

    // 4. Daily profit target
    if let Some(target) = limits.max_profit_per_day {
        if state.daily_pnl >= target {
            return TradeDecision::reject(
                DailyProfitTarget,
                format!("Daily profit target reached: {} (target {})", state.daily_pnl, target),
            );
        }
    }

    // 5. Weekly loss
    if state.weekly_pnl <= -limits.max_loss_per_week {
        let message = format!(
            "Weekly loss limit hit: {} (limit -{})",
            state.weekly_pnl, limits.max_loss_per_week
        );
        warn!(weekly_pnl = %state.weekly_pnl, "Weekly loss limit hit, engaging kill switch");
        state
            .kill_switch
            .activate(KillReason::WeeklyLossLimit, message.clone(), now);
        return TradeDecision::reject(WeeklyLossLimit, message);
    }

    // 6. Trade counts
    if state.daily_trade_count >= limits.max_trades_per_day {
        return TradeDecision::reject(
            DailyTradeLimit,
            format!(
                "Daily trade limit reached: {}/{}",
                state.daily_trade_count, limits.max_trades_per_day
            ),
        );
    }
    if let Some(strategy_limit) = limits.strategy_limit(&candidate.strategy) {
        let taken = state
            .strategy_trade_counts
            .get(&candidate.strategy)
            .copied()
            .unwrap_or(0);
        if taken >= strategy_limit {
            return TradeDecision::reject(
                StrategyTradeLimit,
                format!(
                    "{} trade limit reached: {}/{}",
                    candidate.strategy, taken, strategy_limit
                ),
            );
        }
    }

    // 7. Consecutive losses
    if state.consecutive_losses >= limits.max_consecutive_losses {
        let message = format!(
            "{} consecutive losses, cooling off for {} minutes",
            state.consecutive_losses, limits.cool_off_minutes_after_loss
        );
        info!(consecutive_losses = state.consecutive_losses, "Cool-off started");
        state.circuit_breaker.trip(
            TripReason::ConsecutiveLosses,
            message.clone(),
            now,
            now + Duration::minutes(limits.cool_off_minutes_after_loss),
        );
        return TradeDecision::reject(ConsecutiveLosses, message);
    }

    // 8. Position size
    let value = candidate.value();
    if candidate.price <= Decimal::ZERO || candidate.quantity == 0 {
        return TradeDecision::reject(
            InvalidCandidate,
            format!(
                "Invalid candidate: price {} quantity {}",
                candidate.price, candidate.quantity
            ),
        );
    }
    if value < limits.min_position_value {
        return TradeDecision::reject(
            PositionTooSmall,
            format!("Position value {} below minimum {}", value, limits.min_position_value),
        );
    }
    if value > limits.max_position_value {
        return TradeDecision::reject(
            PositionTooLarge,
            format!("Position value {} above maximum {}", value, limits.max_position_value),
        );
    }
    if value > limits.max_order_value {
        return TradeDecision::reject(
            OrderValueTooLarge,
            format!("Order value {} above maximum {}", value, limits.max_order_value),
        );
    }

    // 9. Capital deployment
    let deployed_after = state.capital_deployed + value;
    if deployed_after > limits.max_capital_deployed {
        return TradeDecision::reject(
            CapitalDeploymentLimit,
            format!(
                "Capital deployed would be {} (limit {})",
                deployed_after, limits.max_capital_deployed
            ),
        );
    }

    // 10. Open positions
    if state.open_positions.len() >= limits.max_open_positions {
        return TradeDecision::reject(
            MaxOpenPositions,
            format!(
                "Max open positions reached: {}/{}",
                state.open_positions.len(),
                limits.max_open_positions
            ),
        );
    }

    // 11. Duplicate and blocked symbols
    if state.open_positions.contains_key(&candidate.symbol) {
        return TradeDecision::reject(
            DuplicateSymbol,
            format!("Already holding {}", candidate.symbol),
        );
    }
    for symbol in state.prune_expired_blocks(now) {
        info!(symbol = %symbol, "Symbol block expired");
    }
    if let Some(until) = state.blocked_symbols.get(&candidate.symbol) {
        return TradeDecision::reject(
            SymbolBlocked,
            format!("{} blocked until {}", candidate.symbol, until.to_rfc3339()),
        );
    }

    // 12. Stop width
    if !candidate.stop_on_loss_side() {
        return TradeDecision::reject(
            InvalidCandidate,
            format!(
                "Stop {} is on the wrong side of a {:?} entry at {}",
                candidate.stop_loss.unwrap_or_default(),
                candidate.direction,
                candidate.price
            ),
        );
    }
    let stop_pct = candidate.stop_loss_percent(limits.default_stop_loss_percent);
    if stop_pct > limits.max_stop_loss_percent {
        return TradeDecision::reject(
            StopLossTooWide,
            format!(
                "Stop loss {:.2}% wider than {}%",
                stop_pct, limits.max_stop_loss_percent
            ),
        );
    }

    // 13. Available capital
    if value > available_capital {
        return TradeDecision::reject(
            InsufficientCapital,
            format!("Need {} but only {} available", value, available_capital),
        );
    }

    TradeDecision::Approved
}
