//! Unified error handling for GridMind.
//!
//! Every crate defines its own focused error enum and converts it into this
//! type at crate boundaries, so callers that only care about the category of
//! a failure can match on a single type.

/// Unified error type for GridMind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage/database errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport failures (socket, serial port, HTTP).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or checksum-mismatched payloads.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout errors.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device is known but currently offline.
    #[error("Device offline: {0}")]
    DeviceOffline(String),

    /// Command refused before reaching the wire.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// An optimizer-initiated action failed.
    #[error("Optimization action failed: {0}")]
    OptimizationActionFailed(String),

    /// Validation errors.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should count toward a device's offline threshold.
    ///
    /// Protocol errors only discard the offending payload; they say nothing
    /// about reachability.
    pub fn affects_availability(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::DeviceOffline(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Convenience macros for creating errors.
#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}
