//! Portfolio risk manager.
//!
//! Owns the trading day's [`RiskState`], runs pre-trade validation, records
//! entries and exits, and manages the circuit breaker and kill switch.
//! Every mutation is written through to the configured store before the
//! lock is released, so callers never observe state that is not durable
//! (or, if the write failed, state that has not halted new entries).

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use market_core::clock::{Clock, SystemClock};
use market_core::config::{Config, RiskLimits, SessionConfig};
use market_core::types::{ExitReason, Position, TradeCandidate, TradeRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreakerState, KillReason, KillSwitchState, TripReason};
use crate::exit_machine::{Evaluation, ExitStateMachine, MarketSnapshot};
use crate::persistence::{reconcile_on_load, JsonFileStore, StatePersistence, StateSnapshot};
use crate::state::RiskState;
use crate::validation::{self, TradeDecision};

/// Point-in-time view of the risk state for dashboards and the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub generated_at: DateTime<Utc>,
    pub trading_date: NaiveDate,
    pub kill_switch: KillSwitchState,
    pub circuit_breaker: CircuitBreakerState,
    pub daily_pnl: Decimal,
    /// Loss still allowed today before the daily limit.
    pub remaining_daily_loss: Decimal,
    pub daily_trades: u32,
    pub max_trades_per_day: u32,
    pub daily_winners: u32,
    pub daily_losers: u32,
    pub consecutive_losses: u32,
    pub weekly_pnl: Decimal,
    pub weekly_trades: u32,
    pub capital_deployed: Decimal,
    pub max_capital_deployed: Decimal,
    pub open_positions: Vec<Position>,
    pub blocked_symbols: BTreeMap<String, DateTime<Utc>>,
    pub recent_trades: Vec<TradeRecord>,
}

impl RiskSummary {
    /// Winning share of today's closed trades, in percent.
    pub fn win_rate(&self) -> Option<Decimal> {
        let total = self.daily_winners + self.daily_losers;
        (total > 0).then(|| {
            Decimal::from(self.daily_winners) / Decimal::from(total) * Decimal::ONE_HUNDRED
        })
    }
}

struct Ledger {
    state: RiskState,
    /// Today's closed trades, oldest first.
    closed_trades: Vec<TradeRecord>,
}

/// Serializes all risk decisions behind one lock.
pub struct RiskManager {
    limits: RiskLimits,
    session: SessionConfig,
    ledger: Mutex<Ledger>,
    /// Fast path flag for checking the kill switch.
    kill_switch: AtomicBool,
    store: Option<Arc<dyn StatePersistence>>,
    clock: Arc<dyn Clock>,
    history_len: usize,
}

impl RiskManager {
    /// Create a risk manager without persistence.
    pub fn new(limits: RiskLimits, session: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let today = session.trading_date(clock.now());
        Self {
            limits,
            session,
            ledger: Mutex::new(Ledger {
                state: RiskState::new(today),
                closed_trades: Vec::new(),
            }),
            kill_switch: AtomicBool::new(false),
            store: None,
            clock,
            history_len: 100,
        }
    }

    /// Create a risk manager that writes through to `store`.
    ///
    /// Call [`RiskManager::load_state`] before trading.
    pub fn with_persistence(
        limits: RiskLimits,
        session: SessionConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StatePersistence>,
    ) -> Self {
        let mut manager = Self::new(limits, session, clock);
        manager.store = Some(store);
        manager
    }

    /// Number of closed trades shown in [`RiskSummary::recent_trades`].
    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    /// Build from application config with a JSON file store and restore state.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.limits.validate()?;
        let store = Arc::new(JsonFileStore::from_config(&config.persistence));
        let manager = Self::with_persistence(
            config.limits.clone(),
            config.session.clone(),
            Arc::new(SystemClock),
            store,
        )
        .with_history_len(config.persistence.trade_history_len);
        manager.load_state().await?;
        Ok(manager)
    }

    /// Open the state described by `config` for inspection only.
    ///
    /// The manager has no store attached, so nothing it does is written back
    /// and a stale snapshot is not archived.
    pub async fn from_config_read_only(config: &Config) -> Result<Self> {
        config.limits.validate()?;
        let manager = Self::new(
            config.limits.clone(),
            config.session.clone(),
            Arc::new(SystemClock),
        )
        .with_history_len(config.persistence.trade_history_len);
        manager
            .inspect_state(&JsonFileStore::from_config(&config.persistence))
            .await?;
        Ok(manager)
    }

    /// Restore state from the store.
    ///
    /// Returns `true` if a snapshot was found. A snapshot from an earlier
    /// day is archived and replaced by a fresh day.
    pub async fn load_state(&self) -> Result<bool> {
        let store = match &self.store {
            Some(store) => store,
            None => {
                warn!("Cannot load state: no persistence configured");
                return Ok(false);
            }
        };

        let snapshot = match store.load().await? {
            Some(snapshot) => snapshot,
            None => {
                info!("No saved risk state, starting fresh");
                return Ok(false);
            }
        };

        if let Some(stale) = self.restore(snapshot).await {
            if let Err(e) = store.archive(stale).await {
                warn!(error = %e, "Failed to archive previous day's state");
            }
        }
        let mut ledger = self.ledger.lock().await;
        self.persist(&mut ledger).await;
        Ok(true)
    }

    /// Reconcile the snapshot in `store` into memory without writing
    /// anything back.
    ///
    /// Returns `true` if a snapshot was found.
    pub async fn inspect_state(&self, store: &dyn StatePersistence) -> Result<bool> {
        match store.load().await? {
            Some(snapshot) => {
                self.restore(snapshot).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the in-memory state with `snapshot` reconciled for today.
    ///
    /// Returns the snapshot's date if it belonged to an earlier day.
    async fn restore(&self, snapshot: StateSnapshot) -> Option<NaiveDate> {
        let now = self.clock.now();
        let today = self.session.trading_date(now);
        let mut ledger = self.ledger.lock().await;
        ledger.state = reconcile_on_load(&snapshot, today);

        let stale = if snapshot.date == today {
            ledger.closed_trades = snapshot.closed_trades;
            info!(
                open_positions = ledger.state.open_positions.len(),
                closed_trades = ledger.closed_trades.len(),
                daily_pnl = %ledger.state.daily_pnl,
                "Restored today's risk state"
            );
            None
        } else {
            info!(
                snapshot_date = %snapshot.date,
                today = %today,
                "New trading day detected, starting fresh daily state"
            );
            ledger.closed_trades.clear();
            Some(snapshot.date)
        };

        for violation in ledger.state.invariant_violations(self.limits.max_open_positions) {
            warn!(violation = %violation, "Restored state is inconsistent");
        }
        ledger.state.sync_capital_deployed();
        self.kill_switch
            .store(ledger.state.kill_switch.active, Ordering::SeqCst);

        if ledger.state.circuit_breaker.cool_off_elapsed(now) {
            info!("Cool-off expired during downtime, lifting circuit breaker");
            Self::lift_breaker(&mut ledger.state);
        }
        stale
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check if the kill switch is engaged (fast path).
    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    /// Whether new entries are currently halted.
    pub async fn is_trading_halted(&self) -> bool {
        if self.is_kill_switch_active() {
            return true;
        }
        self.ledger.lock().await.state.circuit_breaker.tripped
    }

    /// Copy of the full risk state.
    pub async fn state(&self) -> RiskState {
        self.ledger.lock().await.state.clone()
    }

    /// Copies of the open positions, ordered by symbol.
    pub async fn open_positions(&self) -> Vec<Position> {
        self.ledger
            .lock()
            .await
            .state
            .open_positions
            .values()
            .cloned()
            .collect()
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.ledger
            .lock()
            .await
            .state
            .open_positions
            .get(symbol)
            .cloned()
    }

    /// Today's closed trades, oldest first.
    pub async fn closed_trades(&self) -> Vec<TradeRecord> {
        self.ledger.lock().await.closed_trades.clone()
    }

    pub async fn summary(&self) -> RiskSummary {
        let ledger = self.ledger.lock().await;
        let state = &ledger.state;
        let skip = ledger.closed_trades.len().saturating_sub(self.history_len);

        RiskSummary {
            generated_at: self.clock.now(),
            trading_date: state.trading_date,
            kill_switch: state.kill_switch.clone(),
            circuit_breaker: state.circuit_breaker.clone(),
            daily_pnl: state.daily_pnl,
            remaining_daily_loss: (self.limits.max_loss_per_day + state.daily_pnl)
                .max(Decimal::ZERO),
            daily_trades: state.daily_trade_count,
            max_trades_per_day: self.limits.max_trades_per_day,
            daily_winners: state.daily_winners,
            daily_losers: state.daily_losers,
            consecutive_losses: state.consecutive_losses,
            weekly_pnl: state.weekly_pnl,
            weekly_trades: state.weekly_trade_count,
            capital_deployed: state.capital_deployed,
            max_capital_deployed: self.limits.max_capital_deployed,
            open_positions: state.open_positions.values().cloned().collect(),
            blocked_symbols: state.blocked_symbols.clone(),
            recent_trades: ledger.closed_trades[skip..].to_vec(),
        }
    }

    /// Decide whether `candidate` may be entered.
    pub async fn validate_trade(
        &self,
        candidate: &TradeCandidate,
        available_capital: Decimal,
    ) -> TradeDecision {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        let before = ledger.state.clone();

        self.roll_day_if_needed(&mut ledger, now).await;
        if ledger.state.circuit_breaker.cool_off_elapsed(now) {
            Self::lift_breaker(&mut ledger.state);
        }

        let decision = validation::validate(
            &mut ledger.state,
            &self.limits,
            &self.session,
            candidate,
            available_capital,
            now,
        );

        match &decision {
            TradeDecision::Approved => debug!(
                symbol = %candidate.symbol,
                strategy = %candidate.strategy,
                value = %candidate.value(),
                "Trade approved"
            ),
            TradeDecision::Rejected { reason, message } => info!(
                symbol = %candidate.symbol,
                strategy = %candidate.strategy,
                reason = ?reason,
                message = %message,
                "Trade rejected"
            ),
        }

        if ledger.state.kill_switch.active && !before.kill_switch.active {
            self.kill_switch.store(true, Ordering::SeqCst);
            let details = ledger.state.kill_switch.message.clone().unwrap_or_default();
            self.record_emergency("KILL_SWITCH_ACTIVATED", &details).await;
        }
        if ledger.state != before {
            self.persist(&mut ledger).await;
        }
        decision
    }

    /// Record a filled entry.
    ///
    /// Fails if a position in the same symbol is already open.
    pub async fn register_entry(&self, candidate: &TradeCandidate) -> Result<Position> {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        self.roll_day_if_needed(&mut ledger, now).await;
        let state = &mut ledger.state;

        if state.open_positions.contains_key(&candidate.symbol) {
            bail!("Position already open for {}", candidate.symbol);
        }
        if candidate.price <= Decimal::ZERO || candidate.quantity == 0 {
            bail!(
                "Invalid entry for {}: price {} quantity {}",
                candidate.symbol,
                candidate.price,
                candidate.quantity
            );
        }

        let mut position =
            Position::from_candidate(candidate, self.limits.default_stop_loss_percent);
        position.entry_timestamp = now;

        if state.blocked_symbols.remove(&candidate.symbol).is_some() {
            warn!(
                symbol = %candidate.symbol,
                "Entry registered for a blocked symbol, block cleared"
            );
        }
        state
            .open_positions
            .insert(position.symbol.clone(), position.clone());
        state.daily_trade_count += 1;
        state.weekly_trade_count += 1;
        *state
            .strategy_trade_counts
            .entry(position.strategy.clone())
            .or_insert(0) += 1;
        state.sync_capital_deployed();

        for violation in state.invariant_violations(self.limits.max_open_positions) {
            warn!(violation = %violation, "Risk invariant violated after entry");
        }

        info!(
            symbol = %position.symbol,
            strategy = %position.strategy,
            direction = ?position.direction,
            entry_price = %position.entry_price,
            quantity = position.quantity,
            stop_loss = %position.initial_stop_loss,
            capital_deployed = %state.capital_deployed,
            "Entry registered"
        );

        self.persist(&mut ledger).await;
        Ok(position)
    }

    /// Record a filled exit and return the closed trade.
    ///
    /// Returns `Ok(None)` when no position is open for `symbol`, so a
    /// retried exit is a no-op.
    pub async fn register_exit(
        &self,
        symbol: &str,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> Result<Option<TradeRecord>> {
        if exit_price <= Decimal::ZERO {
            bail!("Invalid exit price {} for {}", exit_price, symbol);
        }

        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        let position = match ledger.state.open_positions.remove(symbol) {
            Some(position) => position,
            None => {
                debug!(symbol = symbol, "No open position to exit");
                return Ok(None);
            }
        };

        let message = position
            .exit_signal
            .as_ref()
            .filter(|signal| signal.reason == reason)
            .map(|signal| signal.message.clone())
            .unwrap_or_else(|| reason.as_str().to_string());
        let trade = TradeRecord::from_exit(&position, exit_price, reason, message, now);

        let state = &mut ledger.state;
        state.record_trade(&trade);
        state.sync_capital_deployed();

        if reason.is_stop_loss() {
            let count = state
                .symbol_stop_losses
                .entry(symbol.to_string())
                .or_insert(0);
            *count += 1;
            if *count >= self.limits.symbol_block_after_stop_losses {
                let until = now + Duration::minutes(self.limits.symbol_block_minutes);
                warn!(
                    symbol = symbol,
                    stop_losses = *count,
                    until = %until,
                    "Symbol blocked after repeated stop losses"
                );
                state.blocked_symbols.insert(symbol.to_string(), until);
            }
        }

        if state.daily_pnl <= -self.limits.max_loss_per_day {
            let message = format!(
                "Daily loss limit hit: {} (limit -{})",
                state.daily_pnl, self.limits.max_loss_per_day
            );
            warn!(daily_pnl = %state.daily_pnl, "Circuit breaker tripped");
            let until = self.session.end_of_day(now);
            state
                .circuit_breaker
                .trip(TripReason::DailyLossLimit, message, now, until);
        } else if state.consecutive_losses >= self.limits.max_consecutive_losses {
            let message = format!(
                "{} consecutive losses, cooling off for {} minutes",
                state.consecutive_losses, self.limits.cool_off_minutes_after_loss
            );
            warn!(
                consecutive_losses = state.consecutive_losses,
                "Circuit breaker tripped"
            );
            let until = now + Duration::minutes(self.limits.cool_off_minutes_after_loss);
            state
                .circuit_breaker
                .trip(TripReason::ConsecutiveLosses, message, now, until);
        }

        info!(
            symbol = symbol,
            reason = %reason,
            exit_price = %exit_price,
            pnl = %trade.pnl,
            pnl_percent = %trade.pnl_percent,
            daily_pnl = %state.daily_pnl,
            consecutive_losses = state.consecutive_losses,
            "Exit registered"
        );

        ledger.closed_trades.push(trade.clone());
        self.persist(&mut ledger).await;
        Ok(Some(trade))
    }

    /// Run `machine` against the open position for `symbol`.
    ///
    /// The position is evaluated on a copy and written back (and
    /// persisted) only if the evaluation changed it. Returns `None` when no
    /// position is open.
    pub async fn evaluate_position(
        &self,
        machine: &ExitStateMachine,
        symbol: &str,
        snapshot: &MarketSnapshot,
    ) -> Option<Evaluation> {
        let mut ledger = self.ledger.lock().await;
        let current = ledger.state.open_positions.get(symbol)?;
        let mut working = current.clone();
        let evaluation = machine.evaluate(&mut working, snapshot);

        if working != *current {
            ledger.state.open_positions.insert(symbol.to_string(), working);
            self.persist(&mut ledger).await;
        }
        Some(evaluation)
    }

    /// Halt new entries for `minutes`.
    pub async fn activate_circuit_breaker(&self, reason: TripReason, message: &str, minutes: i64) {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        ledger
            .state
            .circuit_breaker
            .trip(reason, message, now, now + Duration::minutes(minutes));
        warn!(reason = ?reason, message = message, minutes = minutes, "Circuit breaker tripped");
        self.persist(&mut ledger).await;
    }

    /// Lift the breaker once its cool-off has elapsed. Returns `true` if lifted.
    ///
    /// Also rolls into a new trading day when the clock has crossed
    /// midnight with no positions open.
    pub async fn check_and_auto_lift(&self) -> bool {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        let rolled = self.roll_day_if_needed(&mut ledger, now).await;

        let lifted = ledger.state.circuit_breaker.cool_off_elapsed(now);
        if lifted {
            Self::lift_breaker(&mut ledger.state);
        }
        if lifted || rolled {
            self.persist(&mut ledger).await;
        }
        lifted
    }

    pub async fn activate_kill_switch(&self, reason: &str) {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        ledger
            .state
            .kill_switch
            .activate(KillReason::Manual, reason, now);
        self.kill_switch.store(true, Ordering::SeqCst);
        error!(reason = reason, "KILL SWITCH ACTIVATED");
        self.record_emergency("KILL_SWITCH_ACTIVATED", reason).await;
        self.persist(&mut ledger).await;
    }

    /// Clear the kill switch. Requires a named operator.
    pub async fn deactivate_kill_switch(&self, authorized_by: &str) -> Result<()> {
        if authorized_by.trim().is_empty() {
            bail!("Kill switch deactivation requires an authorizing operator");
        }
        let now = self.clock.now();
        let mut ledger = self.ledger.lock().await;
        if !ledger.state.kill_switch.active {
            info!("Kill switch already inactive");
            return Ok(());
        }
        ledger.state.kill_switch.deactivate(authorized_by, now);
        self.kill_switch.store(false, Ordering::SeqCst);
        warn!(authorized_by = authorized_by, "Kill switch deactivated");
        self.record_emergency(
            "KILL_SWITCH_DEACTIVATED",
            &format!("authorized by {}", authorized_by),
        )
        .await;
        self.persist(&mut ledger).await;
        Ok(())
    }

    /// Start a fresh trading day now.
    ///
    /// Weekly counters, symbol blocks, the breaker, and the kill switch are
    /// kept.
    pub async fn reset_daily(&self) {
        let now = self.clock.now();
        let today = self.session.trading_date(now);
        let mut ledger = self.ledger.lock().await;

        let previous = ledger.state.trading_date;
        if !ledger.state.open_positions.is_empty() {
            warn!(
                count = ledger.state.open_positions.len(),
                "Daily reset discards open positions"
            );
        }
        self.archive(previous).await;
        ledger.state.reset_daily(today);
        ledger.closed_trades.clear();
        info!(trading_date = %today, "Daily risk state reset");
        self.persist(&mut ledger).await;
    }

    pub async fn reset_weekly(&self) {
        let mut ledger = self.ledger.lock().await;
        ledger.state.reset_weekly();
        info!("Weekly risk counters reset");
        self.persist(&mut ledger).await;
    }

    /// Write the current state to the store.
    pub async fn save(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let ledger = self.ledger.lock().await;
        let snapshot =
            StateSnapshot::capture(&ledger.state, &ledger.closed_trades, self.clock.now());
        store.save(&snapshot).await
    }

    fn lift_breaker(state: &mut RiskState) {
        let reason = state.circuit_breaker.lift();
        if reason == Some(TripReason::ConsecutiveLosses) {
            state.consecutive_losses = 0;
        }
        info!(reason = ?reason, "Circuit breaker lifted after cool-off");
    }

    /// Move to a new trading day if the clock has crossed into one.
    ///
    /// Skipped while positions are open; the square-off path closes them
    /// first.
    async fn roll_day_if_needed(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> bool {
        let today = self.session.trading_date(now);
        let previous = ledger.state.trading_date;
        if today <= previous {
            return false;
        }
        if !ledger.state.open_positions.is_empty() {
            debug!(
                previous = %previous,
                today = %today,
                "Day rollover deferred while positions are open"
            );
            return false;
        }

        self.archive(previous).await;
        ledger.state.reset_daily(today);
        if previous.iso_week() != today.iso_week() {
            ledger.state.reset_weekly();
        }
        ledger.closed_trades.clear();
        info!(previous = %previous, today = %today, "Rolled into new trading day");
        true
    }

    async fn archive(&self, date: NaiveDate) {
        if let Some(store) = &self.store {
            if let Err(e) = store.archive(date).await {
                warn!(error = %e, date = %date, "Failed to archive risk state");
            }
        }
    }

    async fn record_emergency(&self, event: &str, details: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.record_emergency(event, details).await {
                error!(error = %e, event = event, "Failed to write emergency log");
            }
        }
    }

    /// Write through to the store. A failed write engages the kill switch.
    async fn persist(&self, ledger: &mut Ledger) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        let snapshot =
            StateSnapshot::capture(&ledger.state, &ledger.closed_trades, self.clock.now());
        match store.save(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to persist risk state, halting new entries");
                if !ledger.state.kill_switch.active {
                    ledger.state.kill_switch.activate(
                        KillReason::PersistenceFailure,
                        format!("state persistence failed: {}", e),
                        self.clock.now(),
                    );
                    self.kill_switch.store(true, Ordering::SeqCst);
                    self.record_emergency("PERSISTENCE_FAILURE", &e.to_string())
                        .await;
                }
                false
            }
        }
    }
}
