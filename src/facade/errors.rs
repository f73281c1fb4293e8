//! # Facade Errors
//!
//! Return codes of the underlying pub/sub layer, lifted into a typed error.

use std::fmt;

use thiserror::Error;

/// Result type for facade operations
pub type FacadeResult<T> = Result<T, FacadeError>;

/// Facade return-code categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeErrorKind {
    /// A wait elapsed without any condition triggering
    Timeout,
    /// The entity was already deleted
    AlreadyDeleted,
    /// An argument was rejected
    BadParameter,
    /// The entity is not in a state that allows the operation
    PreconditionNotMet,
    /// Unspecified failure
    Error,
}

impl FacadeErrorKind {
    /// Returns the return-code name
    pub fn as_str(&self) -> &'static str {
        match self {
            FacadeErrorKind::Timeout => "RETCODE_TIMEOUT",
            FacadeErrorKind::AlreadyDeleted => "RETCODE_ALREADY_DELETED",
            FacadeErrorKind::BadParameter => "RETCODE_BAD_PARAMETER",
            FacadeErrorKind::PreconditionNotMet => "RETCODE_PRECONDITION_NOT_MET",
            FacadeErrorKind::Error => "RETCODE_ERROR",
        }
    }
}

impl fmt::Display for FacadeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the pub/sub facade
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct FacadeError {
    /// Return-code category
    pub kind: FacadeErrorKind,
    /// Detail
    pub message: String,
}

impl FacadeError {
    /// Create a new facade error
    pub fn new(kind: FacadeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wait timed out
    pub fn timeout() -> Self {
        Self::new(FacadeErrorKind::Timeout, "wait timed out")
    }

    /// Entity already deleted
    pub fn already_deleted(what: impl Into<String>) -> Self {
        Self::new(FacadeErrorKind::AlreadyDeleted, what)
    }

    /// Bad parameter
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::new(FacadeErrorKind::BadParameter, message)
    }

    /// Precondition not met
    pub fn precondition_not_met(message: impl Into<String>) -> Self {
        Self::new(FacadeErrorKind::PreconditionNotMet, message)
    }

    /// Generic error
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FacadeErrorKind::Error, message)
    }

    /// True if this is a wait timeout
    pub fn is_timeout(&self) -> bool {
        self.kind == FacadeErrorKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_recognised() {
        assert!(FacadeError::timeout().is_timeout());
        assert!(!FacadeError::error("boom").is_timeout());
    }

    #[test]
    fn test_display_carries_return_code() {
        let err = FacadeError::already_deleted("reader 7");
        assert_eq!(err.to_string(), "RETCODE_ALREADY_DELETED: reader 7");
    }
}
