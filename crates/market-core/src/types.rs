//! Core domain types for the intraday trading bot.

pub mod candle;
pub mod order;
pub mod position;
pub mod signal;
pub mod trade;

pub use candle::*;
pub use order::*;
pub use position::*;
pub use signal::*;
pub use trade::*;
