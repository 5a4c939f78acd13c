//! Integration tests for component interactions.
//!
//! These tests drive the risk manager, exit state machine, file-backed
//! persistence, and control loop together against a paper broker.

use chrono::{DateTime, Duration, TimeZone, Utc};
use market_core::broker::PaperBroker;
use market_core::clock::{Clock, ManualClock};
use market_core::config::{Config, EngineConfig, RiskLimits, SessionConfig};
use market_core::types::{
    Candle, Direction, ExitReason, Position, TradeCandidate, TrendDirection,
};
use risk_manager::{
    ExitDecision, ExitStateMachine, JsonFileStore, MarketSnapshot, RejectReason, RiskManager,
    TripReason,
};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use trading_engine::{ControlLoop, RetryPolicy};
use uuid::Uuid;

const SYMBOL: &str = "NIFTY24500CE";

fn d(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

/// Tuesday 10:00 IST.
fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 4, 30, 0).unwrap()
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("intraday-bot-it-{}", Uuid::new_v4()))
}

/// 200 x 75 = 15,000 with a 10% stop.
fn candidate(symbol: &str, strategy: &str) -> TradeCandidate {
    TradeCandidate::new(symbol, strategy, Direction::Long, d(200), 75).with_stop_loss(d(180))
}

fn file_backed_risk(dir: &PathBuf, clock: Arc<ManualClock>, limits: RiskLimits) -> RiskManager {
    RiskManager::with_persistence(
        limits,
        SessionConfig::default(),
        clock,
        Arc::new(JsonFileStore::new(dir.join("risk_state.json"))),
    )
}

async fn paper_loop(
    risk: Arc<RiskManager>,
    broker: Arc<PaperBroker>,
) -> ControlLoop {
    broker.set_trend(SYMBOL, TrendDirection::Bullish).await;
    ControlLoop::new(
        risk,
        broker,
        ExitStateMachine::default(),
        EngineConfig::default(),
        d(100_000),
    )
    .with_retry_policy(RetryPolicy::once(StdDuration::from_secs(1)))
}

#[tokio::test]
async fn test_emergency_exit_on_ltp_alone() {
    let dir = temp_dir();
    let clock = Arc::new(ManualClock::new(morning()));
    let risk = Arc::new(file_backed_risk(&dir, clock.clone(), RiskLimits::default()));
    let broker = Arc::new(PaperBroker::new());
    let engine = paper_loop(risk.clone(), broker.clone()).await;

    broker.set_price(SYMBOL, d(200)).await;
    let report = engine.tick(&[candidate(SYMBOL, "NIFTYBOT")]).await;
    assert_eq!(report.entries.len(), 1);

    clock.advance(Duration::seconds(30));
    broker.set_price(SYMBOL, d(148)).await;
    let report = engine.tick(&[]).await;

    assert_eq!(report.exits.len(), 1);
    let trade = &report.exits[0];
    assert_eq!(trade.exit_reason, ExitReason::EmergencyStop);
    assert_eq!(trade.exit_price, d(148));
    assert_eq!(trade.pnl, d(-3900));
    assert!(risk.open_positions().await.is_empty());
    assert_eq!(engine.available_capital().await, d(96_100));

    // The exit was persisted before the tick returned.
    assert!(dir.join("risk_state.json").exists());

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_recovering_candle_resets_stop_confirmation() {
    let clock = Arc::new(ManualClock::new(morning()));
    let risk = Arc::new(RiskManager::new(
        RiskLimits::default(),
        SessionConfig::default(),
        clock.clone(),
    ));
    let broker = Arc::new(PaperBroker::new());
    let engine = paper_loop(risk.clone(), broker.clone()).await;

    broker.set_price(SYMBOL, d(200)).await;
    engine.tick(&[candidate(SYMBOL, "NIFTYBOT")]).await;

    let mut warnings = Vec::new();
    for (i, close) in [175, 185, 170].into_iter().enumerate() {
        clock.advance(Duration::minutes(5));
        broker.set_price(SYMBOL, d(close)).await;
        broker
            .push_candle(SYMBOL, Candle::flat(d(close), clock.now()))
            .await;
        let report = engine.tick(&[]).await;
        assert!(report.exits.is_empty(), "exited early on candle {}", i);
        warnings.push(risk.position(SYMBOL).await.unwrap().consecutive_stop_warnings);
    }
    assert_eq!(warnings, vec![1, 0, 1]);

    clock.advance(Duration::minutes(5));
    broker.set_price(SYMBOL, d(168)).await;
    broker.push_candle(SYMBOL, Candle::flat(d(168), clock.now())).await;
    let report = engine.tick(&[]).await;

    assert_eq!(report.exits.len(), 1);
    assert_eq!(report.exits[0].exit_reason, ExitReason::HiddenStopLoss);
    assert_eq!(report.exits[0].exit_price, d(168));

    // The same closed candle seen again yields no second exit.
    let report = engine.tick(&[]).await;
    assert!(report.exits.is_empty());
    assert_eq!(risk.closed_trades().await.len(), 1);
}

#[tokio::test]
async fn test_losing_streak_trips_breaker_with_cool_off() {
    let clock = Arc::new(ManualClock::new(morning()));
    let limits = RiskLimits {
        max_consecutive_losses: 3,
        max_trades_per_day: 10,
        ..Default::default()
    };
    let risk = RiskManager::new(limits, SessionConfig::default(), clock.clone());

    for symbol in ["A", "B", "C"] {
        let candidate = candidate(symbol, "STOCKBOT");
        assert!(risk.validate_trade(&candidate, d(100_000)).await.is_approved());
        risk.register_entry(&candidate).await.unwrap();
        clock.advance(Duration::minutes(10));
        risk.register_exit(symbol, d(190), ExitReason::Manual)
            .await
            .unwrap();
    }

    let decision = risk
        .validate_trade(&candidate("D", "STOCKBOT"), d(100_000))
        .await;
    assert_eq!(decision.reject_reason(), Some(RejectReason::CircuitBreaker));

    let state = risk.state().await;
    assert_eq!(
        state.circuit_breaker.trip_reason,
        Some(TripReason::ConsecutiveLosses)
    );
    let resume_at = state.circuit_breaker.resume_at.unwrap();
    assert!(resume_at > clock.now());
}

#[tokio::test]
async fn test_daily_loss_limit_halts_next_validation() {
    let clock = Arc::new(ManualClock::new(morning()));
    let risk = RiskManager::new(RiskLimits::default(), SessionConfig::default(), clock);

    risk.register_entry(&candidate("A", "NIFTYBOT")).await.unwrap();
    let trade = risk
        .register_exit("A", d(130), ExitReason::StopLoss)
        .await
        .unwrap()
        .unwrap();
    assert!(trade.pnl <= -risk.limits().max_loss_per_day);

    let decision = risk
        .validate_trade(&candidate("B", "NIFTYBOT"), d(100_000))
        .await;
    assert!(!decision.is_approved());
    assert!(risk.is_trading_halted().await);
    assert!(risk.state().await.circuit_breaker.tripped);
}

#[tokio::test]
async fn test_capital_deployed_matches_open_positions() {
    let clock = Arc::new(ManualClock::new(morning()));
    let limits = RiskLimits {
        max_open_positions: 3,
        max_trades_per_day: 10,
        max_consecutive_losses: 10,
        ..Default::default()
    };
    let risk = RiskManager::new(limits, SessionConfig::default(), clock);

    async fn assert_consistent(risk: &RiskManager) {
        let state = risk.state().await;
        let open: Decimal = state.open_positions.values().map(Position::value).sum();
        assert_eq!(state.capital_deployed, open);
    }

    risk.register_entry(&candidate("A", "STOCKBOT")).await.unwrap();
    assert_consistent(&risk).await;
    risk.register_entry(
        &TradeCandidate::new("B", "STOCKBOT", Direction::Short, d(120), 100).with_stop_loss(d(130)),
    )
    .await
    .unwrap();
    assert_consistent(&risk).await;
    assert_eq!(risk.state().await.capital_deployed, d(27_000));

    risk.register_exit("A", d(210), ExitReason::ProfitTarget)
        .await
        .unwrap();
    assert_consistent(&risk).await;

    // A repeated exit changes nothing.
    let again = risk
        .register_exit("A", d(210), ExitReason::ProfitTarget)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_consistent(&risk).await;
    assert_eq!(risk.state().await.daily_pnl, d(750));

    risk.register_exit("B", d(110), ExitReason::TrailingStop)
        .await
        .unwrap();
    assert_consistent(&risk).await;
    assert_eq!(risk.state().await.capital_deployed, Decimal::ZERO);
}

#[test]
fn test_trailing_stop_never_moves_down() {
    let machine = ExitStateMachine::default();
    let start = morning();
    let mut position = Position::new(SYMBOL, "NIFTYBOT", Direction::Long, d(200), 75, d(180));

    let path = [
        205, 215, 224, 231, 228, 240, 236, 252, 247, 261, 255, 270, 262, 258, 249, 244,
    ];
    let mut last_stop = position.current_stop_loss;
    for (i, price) in path.into_iter().enumerate() {
        let snapshot = MarketSnapshot::tick(d(price), start + Duration::seconds(i as i64 * 30));
        let evaluation = machine.evaluate(&mut position, &snapshot);

        assert!(
            position.current_stop_loss >= last_stop,
            "stop moved down at {}: {} -> {}",
            price,
            last_stop,
            position.current_stop_loss
        );
        last_stop = position.current_stop_loss;

        if let ExitDecision::Exit(signal) = evaluation.decision {
            assert_eq!(signal.reason, ExitReason::TrailingStop);
            assert!(signal.price > position.entry_price);
            return;
        }
    }
    panic!("trailing stop never fired");
}

#[tokio::test]
async fn test_state_survives_restart_and_day_rollover() {
    let dir = temp_dir();
    let clock = Arc::new(ManualClock::new(morning()));
    let risk = file_backed_risk(&dir, clock.clone(), RiskLimits::default());

    risk.register_entry(&candidate("A", "NIFTYBOT")).await.unwrap();
    risk.register_exit("A", d(190), ExitReason::Manual)
        .await
        .unwrap();
    risk.register_entry(&candidate("B", "NIFTYBOT")).await.unwrap();
    risk.activate_kill_switch("operator drill").await;

    // Same day: identical state.
    let restarted = file_backed_risk(&dir, clock.clone(), RiskLimits::default());
    assert!(restarted.load_state().await.unwrap());
    assert_eq!(restarted.state().await, risk.state().await);
    assert_eq!(restarted.closed_trades().await, risk.closed_trades().await);
    assert!(restarted.is_kill_switch_active());

    // Next day (same week): daily fields reset, weekly and kill switch kept.
    clock.advance(Duration::days(1));
    let next_day = file_backed_risk(&dir, clock.clone(), RiskLimits::default());
    assert!(next_day.load_state().await.unwrap());
    let state = next_day.state().await;
    assert_eq!(state.trading_date, clock.now().date_naive());
    assert_eq!(state.daily_pnl, Decimal::ZERO);
    assert_eq!(state.daily_trade_count, 0);
    assert!(state.open_positions.is_empty());
    assert_eq!(state.capital_deployed, Decimal::ZERO);
    assert_eq!(state.weekly_pnl, d(-750));
    assert_eq!(state.weekly_trade_count, 2);
    assert!(state.kill_switch.active);
    assert!(next_day.is_kill_switch_active());

    assert!(dir.join("risk_state_2026-03-10.json").exists());
    let emergency_log = std::fs::read_to_string(dir.join("emergency_log.txt")).unwrap();
    assert!(emergency_log.contains("KILL_SWITCH_ACTIVATED"));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_read_only_open_leaves_stale_file_alone() {
    let dir = temp_dir();
    let clock = Arc::new(ManualClock::new(morning()));
    let risk = file_backed_risk(&dir, clock, RiskLimits::default());
    risk.register_entry(&candidate("A", "NIFTYBOT")).await.unwrap();
    let state_file = dir.join("risk_state.json");
    let before = std::fs::read(&state_file).unwrap();

    let mut config = Config::default();
    config.persistence.state_dir = dir.clone();
    let viewer = RiskManager::from_config_read_only(&config).await.unwrap();

    // The wall clock is past 2026-03-10, so the snapshot is stale.
    let summary = viewer.summary().await;
    assert!(summary.open_positions.is_empty());
    assert_eq!(summary.daily_trades, 0);
    assert_eq!(std::fs::read(&state_file).unwrap(), before);
    assert!(!dir.join("risk_state_2026-03-10.json").exists());

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_square_off_closes_positions_end_to_end() {
    let clock = Arc::new(ManualClock::new(morning()));
    let risk = Arc::new(RiskManager::new(
        RiskLimits::default(),
        SessionConfig::default(),
        clock.clone(),
    ));
    let broker = Arc::new(PaperBroker::new());
    let engine = paper_loop(risk.clone(), broker.clone()).await;

    broker.set_price(SYMBOL, d(200)).await;
    engine.tick(&[candidate(SYMBOL, "NIFTYBOT")]).await;

    // 15:20 IST
    clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 9, 50, 0).unwrap());
    broker.set_price(SYMBOL, d(204)).await;
    let report = engine.tick(&[candidate("BANKNIFTY52000PE", "BANKNIFTYBOT")]).await;

    assert_eq!(report.exits.len(), 1);
    assert_eq!(report.exits[0].exit_reason, ExitReason::EndOfSession);
    assert!(report.entries.is_empty());
    assert_eq!(broker.fills().await.len(), 2);
}
