//! Error types for event processing.
//!
//! Errors are categorized to decide what the pipeline does with a failed message:
//! - **Transient**: retried with exponential backoff, then surfaced to the router
//! - **Permanent**: never retried; routed to the poison queue when the classifier matches

use std::fmt;
use thiserror::Error;

/// Boxed error used as the underlying cause of wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories determine retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (broker hiccup, downstream timeout). Retried.
    Transient,
    /// Unrecoverable for this message (bad payload, failed validation). Not retried.
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// A message that cannot be processed no matter how often it is retried.
///
/// Produced by schema validation (unknown schema, undecodable payload, rejected
/// by the validator) and by typed handlers that fail to decode their input. It is
/// the signal the poison queue stage keys on.
#[derive(Debug, Error)]
#[error("unprocessable event{}: {reason}", schema_suffix(.schema))]
pub struct UnprocessableEvent {
    /// Raw payload of the rejected message
    pub payload: Vec<u8>,
    /// Schema name from the message metadata, if any
    pub schema: Option<String>,
    /// Short description of what went wrong
    pub reason: String,
    #[source]
    pub cause: Option<BoxError>,
}

fn schema_suffix(schema: &Option<String>) -> String {
    schema
        .as_deref()
        .map(|s| format!(" ({s})"))
        .unwrap_or_default()
}

impl UnprocessableEvent {
    pub fn new(payload: impl Into<Vec<u8>>, reason: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            schema: None,
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Errors produced by the event pipeline, transports and handlers.
#[derive(Debug, Error)]
pub enum EventError {
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport selector is not one of the supported values
    #[error("unknown transport '{0}' (expected kafka, rabbitmq, aws or memory)")]
    UnknownTransport(String),

    /// Transport is known but was not compiled in
    #[error("transport '{0}' is not enabled in this build")]
    TransportUnavailable(String),

    /// Handler registration rejected
    #[error("registration error: {0}")]
    Registration(String),

    /// Broker client failure (connect, publish, subscribe, ack)
    #[error("{transport} transport error: {message}")]
    Transport {
        transport: &'static str,
        message: String,
    },

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Message rejected before reaching business logic
    #[error(transparent)]
    Unprocessable(#[from] UnprocessableEvent),

    /// Domain validation failure raised by a handler
    #[error("validation failed: {0}")]
    Validation(String),

    /// Outbox persistence failed
    #[error("outbox error: {0}")]
    Outbox(String),

    /// Failure returned by a handler
    #[error("handler error: {message}")]
    Handler {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A handler or middleware panicked
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The publisher behind a producer is gone
    #[error("publisher is not initialized")]
    NotInitialized,
}

impl EventError {
    /// Create a transient handler error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient handler error with a source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Handler {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a domain validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a registration error.
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration(message.into())
    }

    /// Create a transport error.
    pub fn transport(transport: &'static str, error: impl fmt::Display) -> Self {
        Self::Transport {
            transport,
            message: error.to_string(),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EventError::Unprocessable(_)
            | EventError::Validation(_)
            | EventError::Serialization(_)
            | EventError::Config(_)
            | EventError::UnknownTransport(_)
            | EventError::TransportUnavailable(_)
            | EventError::Registration(_) => ErrorCategory::Permanent,
            EventError::Transport { .. }
            | EventError::Outbox(_)
            | EventError::Handler { .. }
            | EventError::Panicked(_)
            | EventError::NotInitialized => ErrorCategory::Transient,
        }
    }

    /// Whether the retry stage may attempt this message again.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Whether this is an unprocessable-event error.
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, EventError::Unprocessable(_))
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for EventError {
    fn from(err: prost::DecodeError) -> Self {
        EventError::Serialization(err.to_string())
    }
}

impl From<prost::EncodeError> for EventError {
    fn from(err: prost::EncodeError) -> Self {
        EventError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            EventError::transient("timeout").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            EventError::validation("missing email").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            EventError::from(UnprocessableEvent::new(b"{}".to_vec(), "unknown schema")).category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            EventError::transport("kafka", "broker down").category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_unprocessable_display_includes_schema() {
        let err =
            UnprocessableEvent::new(b"x".to_vec(), "decode failed").with_schema("user.created");
        assert_eq!(
            err.to_string(),
            "unprocessable event (user.created): decode failed"
        );

        let err = UnprocessableEvent::new(b"x".to_vec(), "decode failed");
        assert_eq!(err.to_string(), "unprocessable event: decode failed");
    }

    #[test]
    fn test_unprocessable_keeps_cause() {
        use std::error::Error as _;

        let cause = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = EventError::from(
            UnprocessableEvent::new(b"nope".to_vec(), "bad json").with_cause(cause),
        );

        assert!(err.is_unprocessable());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_is_retryable() {
        assert!(EventError::transient("flaky").is_retryable());
        assert!(!EventError::validation("bad").is_retryable());
        assert!(!EventError::Serialization("bad".into()).is_retryable());
    }
}
