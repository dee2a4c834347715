//! # Error Handling
//!
//! This module provides error handling for the Streamplane data plane core.
//! It defines custom error types using `thiserror` for the extension
//! discovery and connection pool subsystems.

/// Custom result type for Streamplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Streamplane data plane core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors (listener/extension configuration rejected)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (per-slot constraint violations)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Extension config discovery errors (malformed or mismatched updates)
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new discovery error
    pub fn discovery<S: Into<String>>(message: S) -> Self {
        Self::Discovery(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::config("missing config source");
        assert!(matches!(error, Error::Config(_)));
        assert_eq!(error.to_string(), "Configuration error: missing config source");
    }

    #[test]
    fn test_io_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error: Error = io_error.into();
        assert!(matches!(error, Error::Io(_)));
    }
}
