//! Error types for minewatch.
//!
//! Component errors (`DecodeError`, `TransportError`, `DelegateError`,
//! `StoreError`) are defined beside their components and contained there.
//! Only configuration errors are allowed to stop the process.

use thiserror::Error;

use crate::codec::DecodeError;
use crate::delegate::DelegateError;
use crate::listener::TransportError;
use crate::store::StoreError;

/// The main error type for minewatch operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Pipeline Errors ===
    /// An inbound payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The broker connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The external classifier failed.
    #[error("classifier delegate error: {0}")]
    ClassifierDelegate(#[from] DelegateError),

    /// The helmet state store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system or socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

}

/// A specialized Result type for minewatch operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new configuration validation error.
    #[must_use]
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Check if this error came from loading or validating configuration.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigLoad(_) | Self::ConfigValidation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config_validation("roster is empty");
        assert_eq!(err.to_string(), "invalid configuration: roster is empty");
    }

    #[test]
    fn test_is_config_error() {
        assert!(Error::config_validation("bad").is_config_error());
        assert!(!Error::from(StoreError::HelmetLimit { limit: 1 }).is_config_error());
        assert!(!Error::from(DecodeError::MissingField("co2")).is_config_error());
    }

    #[test]
    fn test_from_decode_error() {
        let err: Error = DecodeError::MissingField("co2").into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().contains("co2"));
    }

    #[test]
    fn test_from_transport_error() {
        let err: Error = TransportError::Connection("connection refused".to_string()).into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_from_delegate_error() {
        let err: Error = DelegateError::Timeout { timeout_ms: 500 }.into();
        assert!(matches!(err, Error::ClassifierDelegate(_)));
    }

    #[test]
    fn test_from_store_error() {
        let err: Error = StoreError::HelmetLimit { limit: 2 }.into();
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_from_figment_error() {
        let err: Error = figment::Error::from("bad toml".to_string()).into();
        assert!(err.is_config_error());
    }
}
