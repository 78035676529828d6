//! Error taxonomy for the binding core.
//!
//! Validation failures are returned synchronously from the submitting call
//! and never enter a queue. Failures that happen while a job runs only ever
//! reach that job's own [`JobTicket`](crate::queue::JobTicket).

use thiserror::Error;

/// Errors surfaced by contexts, upscalers and the engine seam
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Malformed or out-of-range argument, rejected before any native call
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The engine could not create its native handle
    #[error("context construction failed: {0}")]
    Construction(String),

    /// Operation attempted on a context that is disposing or disposed
    #[error("context has been disposed")]
    Disposed,

    /// Dispose requested on a context that is already disposing or disposed
    #[error("context was already disposed")]
    AlreadyDisposed,

    /// A native call failed while a job was running
    #[error("engine failure: {0}")]
    EngineFailure(String),

    /// The engine shared library could not be loaded
    #[error("engine library error: {0}")]
    Library(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    pub(crate) fn engine(msg: impl Into<String>) -> Self {
        Error::EngineFailure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_detail() {
        let err = Error::invalid("Invalid weightType");
        assert_eq!(err.to_string(), "invalid parameter: Invalid weightType");

        let err = Error::Construction("Context creation failed".into());
        assert!(err.to_string().contains("Context creation failed"));
    }

    #[test]
    fn test_dispose_errors_are_distinct() {
        assert_ne!(Error::Disposed, Error::AlreadyDisposed);
    }
}
