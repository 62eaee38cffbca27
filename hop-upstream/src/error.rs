//! Error types for upstream DNS operations

use thiserror::Error;

/// Result type alias for upstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or querying an upstream
#[derive(Debug, Error)]
pub enum Error {
    /// Unparseable address, bootstrap entry or stamp, or a hostname
    /// without bootstrap servers to resolve it
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No bootstrap server answered before the deadline
    #[error("bootstrap resolution of {host} timed out")]
    BootstrapTimeout { host: String },

    /// Every bootstrap server answered with an error before the deadline
    #[error("bootstrap resolution failed: {0}")]
    BootstrapFailed(String),

    /// Connection or secure channel setup failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// The per-exchange deadline elapsed
    #[error("exchange timed out")]
    ExchangeTimeout,

    /// Malformed, mismatched or undecryptable response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid options
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse a configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error was caused by a deadline rather than a failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ExchangeTimeout | Error::BootstrapTimeout { .. })
    }
}
