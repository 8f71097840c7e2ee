//! Error types for the Gateward admission-control core.
//!
//! Rejecting a request is never an error: it is a normal outcome carried in
//! [`crate::ratelimit::Decision`]. The error taxonomy here covers only
//! construction-time failures.

use thiserror::Error;

/// Main error type for Gateward operations.
#[derive(Error, Debug)]
pub enum GatewardError {
    /// Configuration-related errors, detected at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (configuration file loading)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gateward operations.
pub type Result<T> = std::result::Result<T, GatewardError>;
