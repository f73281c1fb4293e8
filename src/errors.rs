//! # Bridge Errors
//!
//! Error taxonomy of the messaging layer. Closed-state errors carry fixed
//! messages so callers can match on them.

use thiserror::Error;

use crate::facade::FacadeError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Messaging-layer errors
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    // ==================
    // Closed-state Errors
    // ==================
    /// Operation on a closed consumer
    #[error("This MessageConsumer is closed.")]
    ClosedConsumer,

    /// Operation on a closed producer
    #[error("This MessageProducer is closed.")]
    ClosedProducer,

    /// Operation on a closed session
    #[error("This Session is closed.")]
    ClosedSession,

    /// Operation on a closed connection
    #[error("This Connection is closed.")]
    ClosedConnection,

    // ==================
    // Caller Errors
    // ==================
    /// Invalid argument
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// Operation not allowed in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Destination cannot be used here
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ==================
    // Facade Errors
    // ==================
    /// Wait-set wait failed with a non-timeout status
    #[error("Wait failed: {0}")]
    WaitFailure(String),

    /// Read condition could not be attached to the wait-set
    #[error("Cannot attach read condition to wait set: {0}")]
    AttachFailure(String),

    /// Sample payload could not be decoded
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Any other facade failure
    #[error(transparent)]
    Facade(#[from] FacadeError),
}

impl BridgeError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::ClosedConsumer => "JMS_CONSUMER_CLOSED",
            BridgeError::ClosedProducer => "JMS_PRODUCER_CLOSED",
            BridgeError::ClosedSession => "JMS_SESSION_CLOSED",
            BridgeError::ClosedConnection => "JMS_CONNECTION_CLOSED",
            BridgeError::IllegalArgument(_) => "JMS_ILLEGAL_ARGUMENT",
            BridgeError::IllegalState(_) => "JMS_ILLEGAL_STATE",
            BridgeError::InvalidDestination(_) => "JMS_INVALID_DESTINATION",
            BridgeError::Configuration(_) => "JMS_CONFIGURATION",
            BridgeError::WaitFailure(_) => "JMS_WAIT_FAILURE",
            BridgeError::AttachFailure(_) => "JMS_ATTACH_FAILURE",
            BridgeError::MalformedPayload(_) => "JMS_MALFORMED_PAYLOAD",
            BridgeError::Facade(_) => "JMS_FACADE_ERROR",
        }
    }

    /// True for errors raised because an object was already closed
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            BridgeError::ClosedConsumer
                | BridgeError::ClosedProducer
                | BridgeError::ClosedSession
                | BridgeError::ClosedConnection
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_consumer_message_is_stable() {
        assert_eq!(
            BridgeError::ClosedConsumer.to_string(),
            "This MessageConsumer is closed."
        );
        assert_eq!(BridgeError::ClosedConsumer.code(), "JMS_CONSUMER_CLOSED");
    }

    #[test]
    fn test_closed_classification() {
        assert!(BridgeError::ClosedSession.is_closed());
        assert!(!BridgeError::IllegalArgument("x".into()).is_closed());
    }

    #[test]
    fn test_facade_errors_convert() {
        let err: BridgeError = FacadeError::error("boom").into();
        assert_eq!(err.code(), "JMS_FACADE_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
