//! Tick-driven control loop.
//!
//! Each tick lifts an expired circuit breaker, walks every open position
//! through the exit state machine (placing and registering exits), squares
//! everything off at the end of the session, and finally offers new entry
//! candidates to the risk manager.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use market_core::broker::Broker;
use market_core::config::EngineConfig;
use market_core::types::{ExitReason, Position, TradeCandidate, TradeRecord};
use risk_manager::{
    ExitDecision, ExitStateMachine, MarketSnapshot, RejectReason, RiskManager, TradeDecision,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::retry::{with_retry, RetryPolicy};

/// Quotes older than this are not used to price a square-off.
const QUOTE_MAX_AGE_MINUTES: i64 = 5;

/// Supplies entry candidates from the strategies.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Candidates produced since the last call.
    async fn next_candidates(&self) -> Vec<TradeCandidate>;
}

/// Signal source fed through an mpsc channel.
pub struct ChannelSignalSource {
    rx: Mutex<mpsc::Receiver<TradeCandidate>>,
}

impl ChannelSignalSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<TradeCandidate>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn next_candidates(&self) -> Vec<TradeCandidate> {
        let mut rx = self.rx.lock().await;
        let mut candidates = Vec::new();
        while let Ok(candidate) = rx.try_recv() {
            candidates.push(candidate);
        }
        candidates
    }
}

/// Last traded price seen for a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub ltp: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub breaker_lifted: bool,
    pub evaluated: usize,
    /// Symbols skipped because market data could not be fetched.
    pub skipped: Vec<String>,
    pub exits: Vec<TradeRecord>,
    /// Symbols whose exit order failed; retried next tick.
    pub failed_exits: Vec<String>,
    pub entries: Vec<Position>,
    pub rejected: Vec<(String, RejectReason)>,
}

impl TickReport {
    /// True when nothing worth logging at info level happened.
    pub fn is_quiet(&self) -> bool {
        !self.breaker_lifted
            && self.skipped.is_empty()
            && self.exits.is_empty()
            && self.failed_exits.is_empty()
            && self.entries.is_empty()
            && self.rejected.is_empty()
    }
}

/// Drives positions and entries against a broker.
pub struct ControlLoop {
    risk: Arc<RiskManager>,
    broker: Arc<dyn Broker>,
    machine: ExitStateMachine,
    engine: EngineConfig,
    data_retry: RetryPolicy,
    /// Orders are sent once per tick; a lost acknowledgement must not
    /// become a duplicate order.
    order_retry: RetryPolicy,
    quotes: DashMap<String, Quote>,
    available_capital: Mutex<Decimal>,
}

impl ControlLoop {
    pub fn new(
        risk: Arc<RiskManager>,
        broker: Arc<dyn Broker>,
        machine: ExitStateMachine,
        engine: EngineConfig,
        available_capital: Decimal,
    ) -> Self {
        let data_retry = RetryPolicy::from_config(&engine);
        let order_retry = RetryPolicy::once(data_retry.timeout);
        Self {
            risk,
            broker,
            machine,
            engine,
            data_retry,
            order_retry,
            quotes: DashMap::new(),
            available_capital: Mutex::new(available_capital),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.order_retry = RetryPolicy::once(policy.timeout);
        self.data_retry = policy;
        self
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    pub async fn available_capital(&self) -> Decimal {
        *self.available_capital.lock().await
    }

    /// Most recent quote fetched for `symbol`.
    pub fn last_quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.get(symbol).map(|q| *q)
    }

    /// Run ticks until `shutdown` becomes `true` or its sender is dropped.
    pub async fn run(
        &self,
        signals: Arc<dyn SignalSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let period = Duration::from_secs(self.engine.tick_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let open_positions = self.risk.open_positions().await.len();
        info!(
            tick_secs = period.as_secs(),
            open_positions,
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let candidates = signals.next_candidates().await;
                    let report = self.tick(&candidates).await;
                    if report.is_quiet() {
                        debug!(evaluated = report.evaluated, "Tick complete");
                    } else {
                        info!(
                            evaluated = report.evaluated,
                            exits = report.exits.len(),
                            failed_exits = report.failed_exits.len(),
                            entries = report.entries.len(),
                            rejected = report.rejected.len(),
                            skipped = report.skipped.len(),
                            "Tick complete"
                        );
                    }
                }
                _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => {
                    info!("Shutdown requested, stopping control loop");
                    break;
                }
            }
        }

        self.risk.save().await
    }

    /// One pass over open positions, then entries.
    pub async fn tick(&self, candidates: &[TradeCandidate]) -> TickReport {
        let mut report = TickReport {
            breaker_lifted: self.risk.check_and_auto_lift().await,
            ..Default::default()
        };

        let now = self.risk.clock().now();
        let square_off = self.risk.session().is_square_off_time(now);

        for position in self.risk.open_positions().await {
            self.manage_position(&position, square_off, now, &mut report)
                .await;
        }

        if square_off {
            if !candidates.is_empty() {
                debug!(
                    count = candidates.len(),
                    "Ignoring entry candidates after square-off time"
                );
            }
            return report;
        }

        for candidate in candidates {
            self.try_entry(candidate, &mut report).await;
        }
        report
    }

    async fn manage_position(
        &self,
        position: &Position,
        square_off: bool,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let symbol = position.symbol.as_str();

        if let Some(signal) = position.exit_signal.as_ref().filter(|_| position.is_closed()) {
            info!(symbol = symbol, reason = %signal.reason, "Retrying pending exit");
            self.execute_exit(position, signal.price, signal.reason, report)
                .await;
            return;
        }

        let snapshot = match self.fetch_snapshot(position, now).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(symbol = symbol, error = %e, "Market data unavailable, skipping position");
                report.skipped.push(symbol.to_string());
                if square_off {
                    if let Some(quote) = self.fresh_quote(symbol, now) {
                        self.execute_exit(position, quote.ltp, ExitReason::EndOfSession, report)
                            .await;
                    }
                }
                return;
            }
        };

        let Some(evaluation) = self
            .risk
            .evaluate_position(&self.machine, symbol, &snapshot)
            .await
        else {
            return;
        };
        report.evaluated += 1;
        for event in &evaluation.audit {
            debug!(symbol = symbol, event = ?event, "Exit audit");
        }

        match evaluation.decision {
            ExitDecision::Exit(signal) | ExitDecision::ExitPending(signal) => {
                self.execute_exit(position, signal.price, signal.reason, report)
                    .await;
            }
            ExitDecision::Hold if square_off => {
                self.execute_exit(position, snapshot.ltp, ExitReason::EndOfSession, report)
                    .await;
            }
            ExitDecision::Hold => {}
        }
    }

    async fn fetch_snapshot(
        &self,
        position: &Position,
        now: DateTime<Utc>,
    ) -> market_core::Result<MarketSnapshot> {
        let symbol = position.symbol.as_str();
        let ltp = with_retry(&self.data_retry, "get_last_price", || {
            self.broker.get_last_price(symbol)
        })
        .await?;
        self.quotes.insert(
            symbol.to_string(),
            Quote {
                ltp,
                observed_at: now,
            },
        );

        let candles = with_retry(&self.data_retry, "get_recent_candles", || {
            self.broker.get_recent_candles(
                symbol,
                self.engine.candle_lookback.max(1),
                self.engine.candle_interval,
            )
        })
        .await?;

        let mut snapshot = MarketSnapshot::tick(ltp, now);
        if let Some(candle) = candles.into_iter().last() {
            snapshot = snapshot.with_candle(candle);
        }

        match with_retry(&self.data_retry, "get_signal_strength", || {
            self.broker.get_signal_strength(symbol)
        })
        .await
        {
            Ok(strength) => snapshot = snapshot.with_trend_strength(strength),
            Err(e) => warn!(symbol = symbol, error = %e, "Trend strength unavailable"),
        }

        match with_retry(&self.data_retry, "get_trend_direction", || {
            self.broker.get_trend_direction(symbol)
        })
        .await
        {
            Ok(trend) => {
                snapshot = snapshot.with_trend_reversal(position.direction.is_reversed_by(trend))
            }
            Err(e) => warn!(symbol = symbol, error = %e, "Trend direction unavailable"),
        }

        Ok(snapshot)
    }

    fn fresh_quote(&self, symbol: &str, now: DateTime<Utc>) -> Option<Quote> {
        self.last_quote(symbol)
            .filter(|q| now - q.observed_at <= ChronoDuration::minutes(QUOTE_MAX_AGE_MINUTES))
    }

    async fn execute_exit(
        &self,
        position: &Position,
        price: Decimal,
        reason: ExitReason,
        report: &mut TickReport,
    ) {
        let symbol = position.symbol.as_str();
        let side = position.direction.exit_side();
        let order = with_retry(&self.order_retry, "place_order", || {
            self.broker.place_order(symbol, side, position.quantity)
        })
        .await;

        let order_id = match order {
            Ok(order_id) => order_id,
            Err(e) => {
                error!(
                    symbol = symbol,
                    reason = %reason,
                    error = %e,
                    "Exit order failed, will retry next tick"
                );
                report.failed_exits.push(symbol.to_string());
                return;
            }
        };

        match self.risk.register_exit(symbol, price, reason).await {
            Ok(Some(trade)) => {
                *self.available_capital.lock().await += position.value() + trade.pnl;
                info!(
                    symbol = symbol,
                    order_id = %order_id,
                    reason = %reason,
                    pnl = %trade.pnl,
                    "Position closed"
                );
                report.exits.push(trade);
            }
            Ok(None) => debug!(symbol = symbol, "Exit already registered"),
            Err(e) => error!(symbol = symbol, error = %e, "Failed to register exit"),
        }
    }

    async fn try_entry(&self, candidate: &TradeCandidate, report: &mut TickReport) {
        let available = self.available_capital().await;
        match self.risk.validate_trade(candidate, available).await {
            TradeDecision::Approved => {}
            TradeDecision::Rejected { reason, .. } => {
                report.rejected.push((candidate.symbol.clone(), reason));
                return;
            }
        }

        let symbol = candidate.symbol.as_str();
        let side = candidate.direction.entry_side();
        let order = with_retry(&self.order_retry, "place_order", || {
            self.broker.place_order(symbol, side, candidate.quantity)
        })
        .await;

        let order_id = match order {
            Ok(order_id) => order_id,
            Err(e) => {
                warn!(symbol = symbol, error = %e, "Entry order failed");
                return;
            }
        };

        match self.risk.register_entry(candidate).await {
            Ok(position) => {
                *self.available_capital.lock().await -= position.value();
                info!(
                    symbol = symbol,
                    order_id = %order_id,
                    value = %position.value(),
                    "Position opened"
                );
                report.entries.push(position);
            }
            Err(e) => {
                error!(
                    symbol = symbol,
                    order_id = %order_id,
                    error = %e,
                    "Filled entry could not be registered"
                );
                self.risk
                    .activate_kill_switch(&format!(
                        "untracked fill {} for {}: {}",
                        order_id, symbol, e
                    ))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use market_core::broker::PaperBroker;
    use market_core::clock::ManualClock;
    use market_core::config::{ExitConfig, RiskLimits, SessionConfig};
    use market_core::types::{Candle, CandleInterval, Direction, OrderSide, TrendDirection};
    use mockall::mock;

    mock! {
        pub TestBroker {}

        #[async_trait]
        impl Broker for TestBroker {
            async fn get_last_price(&self, symbol: &str) -> market_core::Result<Decimal>;
            async fn get_recent_candles(
                &self,
                symbol: &str,
                count: usize,
                interval: CandleInterval,
            ) -> market_core::Result<Vec<Candle>>;
            async fn place_order(
                &self,
                symbol: &str,
                side: OrderSide,
                quantity: u32,
            ) -> market_core::Result<String>;
            async fn get_signal_strength(&self, symbol: &str) -> market_core::Result<f64>;
            async fn get_trend_direction(
                &self,
                symbol: &str,
            ) -> market_core::Result<TrendDirection>;
        }
    }

    fn morning() -> DateTime<Utc> {
        // 10:00 IST
        Utc.with_ymd_and_hms(2026, 3, 10, 4, 30, 0).unwrap()
    }

    fn d(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            timeout: Duration::from_millis(100),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    fn risk(clock: Arc<ManualClock>) -> Arc<RiskManager> {
        Arc::new(RiskManager::new(
            RiskLimits::default(),
            SessionConfig::default(),
            clock,
        ))
    }

    fn control(risk: Arc<RiskManager>, broker: Arc<dyn Broker>) -> ControlLoop {
        ControlLoop::new(
            risk,
            broker,
            ExitStateMachine::new(ExitConfig::default()),
            EngineConfig::default(),
            d(100_000),
        )
        .with_retry_policy(fast_retry())
    }

    fn candidate(symbol: &str) -> TradeCandidate {
        TradeCandidate::new(symbol, "NIFTYBOT", Direction::Long, d(200), 75)
            .with_stop_loss(d(180))
            .with_trend_strength(18.0)
    }

    #[tokio::test]
    async fn test_entry_then_emergency_exit() {
        let clock = Arc::new(ManualClock::new(morning()));
        let broker = Arc::new(PaperBroker::new());
        let risk = risk(clock.clone());
        let engine = control(risk.clone(), broker.clone());

        broker.set_price("NIFTY24500CE", d(200)).await;
        let report = engine.tick(&[candidate("NIFTY24500CE")]).await;
        assert_eq!(report.entries.len(), 1);
        assert_eq!(engine.available_capital().await, d(85_000));

        broker.set_price("NIFTY24500CE", d(148)).await;
        clock.advance(ChronoDuration::seconds(30));
        let report = engine.tick(&[]).await;

        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].exit_reason, ExitReason::EmergencyStop);
        assert_eq!(report.exits[0].exit_price, d(148));
        assert!(risk.open_positions().await.is_empty());
        assert_eq!(engine.available_capital().await, d(96_100));

        let fills = broker.fills().await;
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_market_data_failure_skips_position() {
        let clock = Arc::new(ManualClock::new(morning()));
        let broker = Arc::new(PaperBroker::new());
        let risk = risk(clock.clone());
        let engine = control(risk.clone(), broker.clone());

        broker.set_price("X", d(200)).await;
        engine.tick(&[candidate("X")]).await;

        broker.fail_symbol("X", "feed down").await;
        let report = engine.tick(&[]).await;

        assert_eq!(report.skipped, vec!["X".to_string()]);
        assert_eq!(report.evaluated, 0);
        assert_eq!(risk.open_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_exit_order_is_retried_next_tick() {
        let clock = Arc::new(ManualClock::new(morning()));
        let risk = risk(clock.clone());
        risk.register_entry(&candidate("X")).await.unwrap();

        let mut broker = MockTestBroker::new();
        broker
            .expect_get_last_price()
            .returning(|_| Ok(Decimal::new(140, 0)));
        broker
            .expect_get_recent_candles()
            .returning(|_, _, _| Ok(Vec::new()));
        broker
            .expect_get_signal_strength()
            .returning(|_| Ok(12.0));
        broker
            .expect_get_trend_direction()
            .returning(|_| Ok(TrendDirection::Bullish));
        let mut attempts = 0;
        broker
            .expect_place_order()
            .withf(|symbol, side, quantity| {
                symbol.to_string() == "X" && *side == OrderSide::Sell && *quantity == 75
            })
            .times(2)
            .returning(move |_, _, _| {
                attempts += 1;
                if attempts == 1 {
                    Err(market_core::Error::broker("gateway timeout"))
                } else {
                    Ok("ORD-2".to_string())
                }
            });

        let engine = control(risk.clone(), Arc::new(broker));

        let first = engine.tick(&[]).await;
        assert_eq!(first.failed_exits, vec!["X".to_string()]);
        let pending = risk.position("X").await.unwrap();
        assert!(pending.is_closed());

        let second = engine.tick(&[]).await;
        assert_eq!(second.exits.len(), 1);
        assert_eq!(second.exits[0].exit_reason, ExitReason::EmergencyStop);
        assert_eq!(second.exits[0].exit_price, d(140));
        assert!(risk.position("X").await.is_none());
    }

    #[tokio::test]
    async fn test_strength_failure_still_evaluates() {
        let clock = Arc::new(ManualClock::new(morning()));
        let risk = risk(clock.clone());
        risk.register_entry(&candidate("X")).await.unwrap();

        let mut broker = MockTestBroker::new();
        broker
            .expect_get_last_price()
            .returning(|_| Ok(Decimal::new(205, 0)));
        broker
            .expect_get_recent_candles()
            .returning(|_, _, _| Ok(Vec::new()));
        broker
            .expect_get_signal_strength()
            .returning(|_| Err(market_core::Error::broker("indicator service down")));
        broker
            .expect_get_trend_direction()
            .returning(|_| Ok(TrendDirection::Bullish));
        broker.expect_place_order().never();

        let engine = control(risk.clone(), Arc::new(broker));
        let report = engine.tick(&[]).await;

        assert_eq!(report.evaluated, 1);
        assert!(report.skipped.is_empty());
        assert_eq!(engine.last_quote("X").unwrap().ltp, d(205));
    }

    #[tokio::test]
    async fn test_square_off_closes_everything_and_blocks_entries() {
        let clock = Arc::new(ManualClock::new(morning()));
        let broker = Arc::new(PaperBroker::new());
        let risk = risk(clock.clone());
        let engine = control(risk.clone(), broker.clone());

        broker.set_price("X", d(200)).await;
        engine.tick(&[candidate("X")]).await;

        // 15:20 IST
        clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 9, 50, 0).unwrap());
        broker.set_price("X", d(204)).await;
        broker.set_price("Y", d(200)).await;
        let report = engine.tick(&[candidate("Y")]).await;

        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].exit_reason, ExitReason::EndOfSession);
        assert!(report.entries.is_empty());
        assert!(risk.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_candidates_are_reported() {
        let clock = Arc::new(ManualClock::new(morning()));
        let broker = Arc::new(PaperBroker::new());
        let risk = risk(clock.clone());
        let engine = control(risk.clone(), broker.clone());

        risk.activate_kill_switch("test").await;
        broker.set_price("X", d(200)).await;
        let report = engine.tick(&[candidate("X")]).await;

        assert_eq!(
            report.rejected,
            vec![("X".to_string(), RejectReason::KillSwitch)]
        );
        assert!(broker.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(morning()));
        let broker = Arc::new(PaperBroker::new());
        let risk = risk(clock.clone());
        let engine = Arc::new(control(risk.clone(), broker.clone()));
        broker.set_price("X", d(200)).await;

        let (tx, source) = ChannelSignalSource::new(8);
        tx.send(candidate("X")).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(Arc::new(source), shutdown_rx).await })
        };

        // The first interval tick fires immediately.
        for _ in 0..50 {
            if !risk.open_positions().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();

        runner.await.unwrap().unwrap();
        assert_eq!(risk.open_positions().await.len(), 1);
    }
}
