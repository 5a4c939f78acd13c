//! Intraday Bot: position lifecycle and risk control for intraday options
//! trading.
//!
//! This is the root crate that provides benchmark and integration test
//! access to the internal crates. For actual functionality, use the
//! individual crates directly:
//!
//! - `market-core`: Domain types, broker contract, configuration, clock
//! - `risk-manager`: Exit state machine, trade validation, circuit breaker, persistence
//! - `trading-engine`: Tick-driven control loop and broker retries
//! - `risk-console`: `riskctl` operator CLI

// Re-export for benchmarks
pub use market_core as core;
pub use risk_manager as risk;
pub use trading_engine as trading;
