//! Error types for the simulation core.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the simulation core.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bar source handed to the driver has no bars.
    #[error("Empty bar series: {0}")]
    EmptyBars(String),

    /// Data error (invalid or missing data).
    #[error("Data error: {0}")]
    Data(String),

    /// An invariant check failed while running in strict mode.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Order sequencing error.
    #[error("Sequencer error: {0}")]
    Sequencer(String),

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Strategy callback error.
    #[error("Strategy error: {0}")]
    Strategy(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an empty-bars error.
    pub fn empty_bars(msg: impl Into<String>) -> Self {
        Error::EmptyBars(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }

    /// Create an invariant error.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    /// Create a sequencer error.
    pub fn sequencer(msg: impl Into<String>) -> Self {
        Error::Sequencer(msg.into())
    }

    /// Create a broker error.
    pub fn broker(msg: impl Into<String>) -> Self {
        Error::Broker(msg.into())
    }

    /// Create a strategy error.
    pub fn strategy(msg: impl Into<String>) -> Self {
        Error::Strategy(msg.into())
    }
}
