//! Error types for driver construction and locator parsing.
//!
//! Only failures that leave a driver unusable surface as errors. The send
//! and receive paths absorb their failures locally (log + counter).

use std::io;
use thiserror::Error;

/// Errors raised while parsing or querying a service locator.
///
/// `NoSuchKey` and `BadValue` are deliberately distinct so callers can
/// report "you forgot an option" differently from "that option is wrong".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    /// A required option is absent
    #[error("Service locator '{locator}' has no option '{key}'")]
    NoSuchKey {
        /// Option name
        key: String,
        /// Original locator string
        locator: String,
    },

    /// An option is present but cannot be parsed
    #[error("Service locator '{locator}' has malformed option {key}={value}")]
    BadValue {
        /// Option name
        key: String,
        /// Raw option value
        value: String,
        /// Original locator string
        locator: String,
    },

    /// The locator string itself does not follow `protocol:key=value,...`
    #[error("Malformed service locator: {0}")]
    Malformed(String),
}

/// Fatal driver construction errors.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No compatible device or port
    #[error("No such device: {0}")]
    NoDevice(String),

    /// Port exists but has no active link
    #[error("Link down: {0}")]
    LinkDown(String),

    /// Packet memory could not be allocated or registered
    #[error("Failed to create packet pool: {0}")]
    PoolCreation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Locator option missing or malformed
    #[error(transparent)]
    Locator(#[from] LocatorError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Misuse of a packet buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// More buffers were returned than were taken out
    #[error("Packet pool underflow: buffer returned more often than acquired")]
    Underflow,
}

/// Result type for driver construction
pub type DriverResult<T> = Result<T, DriverError>;

/// Result type for locator queries
pub type LocatorResult<T> = Result<T, LocatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_error_into_driver_error() {
        let err: DriverError = LocatorError::NoSuchKey {
            key: "lid".into(),
            locator: "basic+infud:".into(),
        }
        .into();
        assert!(matches!(
            err,
            DriverError::Locator(LocatorError::NoSuchKey { .. })
        ));
    }

    #[test]
    fn test_error_display() {
        let err = DriverError::LinkDown("port 0".into());
        assert_eq!(err.to_string(), "Link down: port 0");

        let err = LocatorError::BadValue {
            key: "port".into(),
            value: "abc".into(),
            locator: "udp:port=abc".into(),
        };
        assert!(err.to_string().contains("port=abc"));
    }
}
