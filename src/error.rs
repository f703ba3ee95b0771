//! Error types for the Floodgate admission core.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Rejected requests are not errors; they come back as
/// [`Decision`](crate::ratelimit::Decision) values. Everything here is either
/// a construction-time failure or a lifecycle failure at shutdown.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid policy or tuning values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be assembled
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The background reaper task panicked or was aborted
    #[error("Reaper error: {0}")]
    Reaper(String),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
