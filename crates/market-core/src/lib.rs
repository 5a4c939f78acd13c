//! Market Core Library
//!
//! Shared domain types, the broker collaborator contract, and configuration
//! for the intraday trading bot.

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
