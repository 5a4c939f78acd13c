//! Risk Manager
//!
//! Exit decisions for open positions, pre-trade validation, circuit breaker
//! and kill switch, and crash-safe persistence of the trading day.

pub mod circuit_breaker;
pub mod exit_machine;
pub mod manager;
pub mod persistence;
pub mod state;
pub mod validation;

pub use circuit_breaker::{CircuitBreakerState, KillReason, KillSwitchState, TripReason};
pub use exit_machine::{
    AuditEvent, Evaluation, ExitDecision, ExitStateMachine, MarketSnapshot, TrendRegime,
};
pub use manager::{RiskManager, RiskSummary};
pub use persistence::{
    reconcile_on_load, JsonFileStore, MemoryStore, StatePersistence, StateSnapshot,
    SCHEMA_VERSION,
};
pub use state::RiskState;
pub use validation::{RejectReason, TradeDecision};
