//! Latency benchmarks for per-tick decisions.
//!
//! Run with: `cargo bench --bench latency`

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;

use market_core::config::{RiskLimits, SessionConfig};
use market_core::types::{Candle, Direction, Position, TradeCandidate};
use risk_manager::validation::validate;
use risk_manager::{reconcile_on_load, ExitStateMachine, MarketSnapshot, RiskState, StateSnapshot};

fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 4, 30, 0).unwrap()
}

fn open_position() -> Position {
    Position::new(
        "NIFTY24500CE",
        "NIFTYBOT",
        Direction::Long,
        Decimal::new(200, 0),
        75,
        Decimal::new(180, 0),
    )
}

/// Benchmark one exit evaluation on a quiet tick and on a fresh candle.
fn bench_exit_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("exit_evaluation");
    let machine = ExitStateMachine::default();

    let tick = MarketSnapshot::tick(Decimal::new(2105, 1), morning());
    group.bench_function("ltp_only", |b| {
        b.iter_batched(
            open_position,
            |mut position| black_box(machine.evaluate(&mut position, black_box(&tick))),
            criterion::BatchSize::SmallInput,
        )
    });

    let candle = Candle::new(
        Decimal::new(190, 0),
        Decimal::new(192, 0),
        Decimal::new(174, 0),
        Decimal::new(175, 0),
        morning() + Duration::minutes(5),
    );
    let with_candle = MarketSnapshot::tick(Decimal::new(176, 0), morning())
        .with_candle(candle)
        .with_trend_strength(27.5)
        .with_trend_reversal(false);
    group.bench_function("candle_close", |b| {
        b.iter_batched(
            open_position,
            |mut position| black_box(machine.evaluate(&mut position, black_box(&with_candle))),
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark the full pre-trade check chain for an approvable candidate.
fn bench_trade_validation(c: &mut Criterion) {
    let limits = RiskLimits::default();
    let session = SessionConfig::default();
    let candidate = TradeCandidate::new(
        "BANKNIFTY52000PE",
        "BANKNIFTYBOT",
        Direction::Long,
        Decimal::new(250, 0),
        60,
    )
    .with_stop_loss(Decimal::new(225, 0));

    let mut state = RiskState::new(morning().date_naive());
    state
        .open_positions
        .insert("NIFTY24500CE".to_string(), open_position());
    state.sync_capital_deployed();

    c.bench_function("validate_trade", |b| {
        b.iter(|| {
            black_box(validate(
                &mut state,
                &limits,
                &session,
                black_box(&candidate),
                Decimal::new(100_000, 0),
                morning(),
            ))
        })
    });
}

/// Benchmark snapshot encode and the pure reconcile step of a restart.
fn bench_state_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_snapshot");

    let mut state = RiskState::new(morning().date_naive());
    state
        .open_positions
        .insert("NIFTY24500CE".to_string(), open_position());
    state.sync_capital_deployed();
    let snapshot = StateSnapshot::capture(&state, &[], morning());

    group.bench_function("serialize", |b| {
        b.iter(|| black_box(serde_json::to_vec(black_box(&snapshot)).unwrap()))
    });

    let next_day = morning().date_naive() + Duration::days(1);
    group.bench_function("reconcile_next_day", |b| {
        b.iter(|| black_box(reconcile_on_load(black_box(&snapshot), next_day)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_exit_evaluation,
    bench_trade_validation,
    bench_state_snapshot,
);

criterion_main!(benches);
