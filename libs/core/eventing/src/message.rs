//! Wire message and delivery wrapper.

use crate::error::EventError;
use crate::metadata::Metadata;
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// A message travelling through the pipeline.
///
/// Owned by one chain traversal at a time. Stages that need the original
/// (retry, poison queue) clone it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique per emission
    pub uuid: String,
    pub payload: Vec<u8>,
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with a fresh UUID and empty metadata.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Payload as text, for logging.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Settles a received message with its transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Mark the message as processed.
    async fn ack(&self) -> Result<(), EventError>;

    /// Mark the message as failed.
    ///
    /// With `requeue` the transport should redeliver it; without, the transport
    /// drops it or leaves it to its own redrive policy.
    async fn nack(&self, requeue: bool) -> Result<(), EventError>;
}

/// Acknowledger for transports without settlement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAcknowledger;

#[async_trait]
impl Acknowledger for NoopAcknowledger {
    async fn ack(&self) -> Result<(), EventError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), EventError> {
        Ok(())
    }
}

/// A received message plus the handle used to settle it.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: impl Acknowledger + 'static) -> Self {
        Self {
            message,
            acker: Box::new(acker),
        }
    }

    /// Delivery that needs no settlement.
    pub fn unacknowledged(message: Message) -> Self {
        Self::new(message, NoopAcknowledger)
    }

    /// Split into the message and its acknowledger.
    pub fn into_parts(self) -> (Message, Box<dyn Acknowledger>) {
        (self.message, self.acker)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_messages_get_unique_ids() {
        let a = Message::new(b"{}".to_vec());
        let b = Message::new(b"{}".to_vec());
        assert_ne!(a.uuid, b.uuid);
        assert!(a.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_delivery() {
        let delivery = Delivery::unacknowledged(Message::new("hi"));
        let (message, acker) = delivery.into_parts();
        assert_eq!(message.payload_lossy(), "hi");
        assert!(acker.ack().await.is_ok());
        assert!(acker.nack(true).await.is_ok());
    }
}
