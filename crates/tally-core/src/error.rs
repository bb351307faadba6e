//! Error types for tally.

use thiserror::Error;

/// Result type alias using tally's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tally operations.
///
/// The first five variants map one-to-one onto the failure kinds of the
/// aggregation pipeline; the worker decides ack/no-ack from the kind alone.
#[derive(Error, Debug)]
pub enum Error {
    /// Stream broker could not be reached (read, ack, append).
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A stream message field could not be interpreted.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Durable relational write failed (aggregates or correlations).
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// Columnar analytical store write or query failed.
    #[error("Analytical store error: {0}")]
    AnalyticalStore(String),

    /// Recent-feed cache operation failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A bounded store call did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure leaves the batch's durability-critical writes
    /// incomplete. Only best-effort sink errors are non-critical.
    pub fn is_durability_critical(&self) -> bool {
        !matches!(self, Error::AnalyticalStore(_) | Error::Cache(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
