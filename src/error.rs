//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScopeError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from configuration issues to hardware faults and wire-protocol problems.
//!
//! ## Error Hierarchy
//!
//! `ScopeError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration,
//!   such as stage bounds whose minimum exceeds their maximum. These are
//!   caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error`, covering all file I/O issues
//!   (e.g. opening a volume file for the file-backed backend).
//! - **`Hardware`**: A general category for errors originating from microscope
//!   backends, from a failed stage move to a capture fault.
//! - **`HardwareClosed`**: Returned for any hardware-contract call issued
//!   after `shutdown()` has completed.
//! - **`Codec`**: A wire message that could not be converted to its domain
//!   representation. Malformed messages are dropped with a warning, the
//!   connection stays up.
//! - **`Transport`/`Remote`**: Failures of the gRPC bridge itself and errors
//!   reported back by the remote side.
//!
//! By using `#[from]`, `ScopeError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ScopeError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Hardware has been shut down")]
    HardwareClosed,

    #[error("Agent terminated: {0}")]
    AgentTerminated(String),

    #[error("Malformed wire message: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Remote call failed: {0}")]
    Remote(String),
}

impl From<tonic::Status> for ScopeError {
    fn from(status: tonic::Status) -> Self {
        ScopeError::Remote(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::Hardware("stage jammed".to_string());
        assert_eq!(err.to_string(), "Hardware error: stage jammed");
    }

    #[test]
    fn test_closed_hardware_error() {
        let err = ScopeError::HardwareClosed;
        assert!(err.to_string().contains("shut down"));
    }
}
