//! Trading Engine
//!
//! Drives open positions through the exit state machine and routes approved
//! entries to the broker on a fixed tick.

pub mod control_loop;
pub mod retry;

pub use control_loop::{ChannelSignalSource, ControlLoop, Quote, SignalSource, TickReport};
pub use retry::{with_retry, RetryPolicy};
