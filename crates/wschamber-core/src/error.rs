//! Shared error type across wschamber crates.

use thiserror::Error;

/// Shared result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Unified error type used by core and relay.
///
/// Errors detected before the upgrade are answered as HTTP responses
/// (`http_status`); errors after the upgrade are answered as WebSocket close
/// frames (`close_code`).
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed HTTP request or header section.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Origin not in the permitted list.
    #[error("origin {0} not permitted")]
    OriginNotPermitted(String),
    /// No registered handler accepted the upgrade.
    #[error("no handler for request")]
    NoHandler,
    /// WebSocket protocol violation after upgrade.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Admission or resource cap reached.
    #[error("{0}")]
    CapacityExceeded(String),
    /// Application header segment exceeded its buffer.
    #[error("header too large")]
    HeaderOverflow,
    #[error("internal: {0}")]
    Internal(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status used when the error is raised before the upgrade.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::BadRequest(_) | RelayError::Protocol(_) => 400,
            RelayError::OriginNotPermitted(_) => 403,
            RelayError::NoHandler => 404,
            RelayError::CapacityExceeded(_)
            | RelayError::HeaderOverflow
            | RelayError::Internal(_)
            | RelayError::Io(_) => 500,
        }
    }

    /// WebSocket close code used when the error is raised after the upgrade.
    pub fn close_code(&self) -> u16 {
        match self {
            RelayError::Protocol(_) => 1002,
            RelayError::CapacityExceeded(_) => 1013,
            RelayError::HeaderOverflow => 4000,
            RelayError::BadRequest(_)
            | RelayError::OriginNotPermitted(_)
            | RelayError::NoHandler
            | RelayError::Internal(_)
            | RelayError::Io(_) => 1011,
        }
    }
}
