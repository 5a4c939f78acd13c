//! Error types for the intraday trading bot.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Order rejected: {message}")]
    OrderRejected { message: String },
}

impl Error {
    /// Build a broker error from any displayable message.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Whether the failure is worth retrying (network/timeout class).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Broker { .. } | Self::Timeout { .. } | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
