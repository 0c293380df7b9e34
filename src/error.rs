//! Error types for the tape transport

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving a stream chain.
///
/// Would-block and end-of-stream are not errors; they are reported through
/// [`Transfer`](crate::domain::Transfer).
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported mode combination or chain geometry
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Operation invoked in a state that forbids it
    #[error("Protocol error: {operation} is not allowed on the {node} stream while {state}")]
    Protocol {
        node: &'static str,
        operation: &'static str,
        state: String,
    },

    /// Fatal failure from the underlying transport
    #[error("Device failure during {operation}: {source}")]
    DeviceFailure {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A received sector failed its structural check and the policy is to halt
    #[error("Sector {sequence} failed integrity check: {reason}")]
    Integrity { sequence: u64, reason: String },

    /// The advisory timeout elapsed while the device stayed not-ready
    #[error("The {node} stream stalled after waiting {waited:?}")]
    Timeout {
        node: &'static str,
        waited: Duration,
    },

    /// Application-side I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an OS-level failure from a device adapter.
    pub fn device(operation: &'static str, source: std::io::Error) -> Self {
        Error::DeviceFailure { operation, source }
    }

    /// Returns true for failures that must tear the whole chain down.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Error::DeviceFailure { .. })
    }

    /// Returns true for programmer errors in call sequencing.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol { .. })
    }
}
