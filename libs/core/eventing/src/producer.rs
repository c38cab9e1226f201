//! Event producer for application code outside the handler pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventing::Metadata;
//!
//! let producer = service.producer();
//!
//! // From an HTTP handler
//! let message_id = producer
//!     .publish_json("orders.created", &OrderCreated { id: 7 }, Metadata::new())
//!     .await?;
//! ```

use crate::codec::{Codec, Json, Proto};
use crate::error::EventError;
use crate::message::Message;
use crate::metadata::{Metadata, SCHEMA_KEY};
use crate::metrics::EventMetrics;
use crate::registry::EventSchema;
use crate::transport::Publisher;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::{Arc, Weak};
use tracing::debug;

const PRODUCER: &str = "producer";

/// Publishes typed events through the service's active publisher.
///
/// Holds only a weak reference: once the owning service is dropped, every
/// publish fails with [`EventError::NotInitialized`].
#[derive(Clone)]
pub struct Producer {
    publisher: Weak<dyn Publisher>,
    metrics: EventMetrics,
}

impl Producer {
    pub fn new(publisher: &Arc<dyn Publisher>) -> Self {
        Self {
            publisher: Arc::downgrade(publisher),
            metrics: EventMetrics::new(PRODUCER),
        }
    }

    /// Encode `value` with codec `C` and publish it to `queue`.
    ///
    /// The message gets a fresh uuid and `event_message_schema = T::SCHEMA`.
    /// Returns the uuid of the published message.
    pub async fn publish<T, C>(
        &self,
        queue: &str,
        value: &T,
        metadata: Metadata,
    ) -> Result<String, EventError>
    where
        T: EventSchema,
        C: Codec<T>,
    {
        let publisher = self.publisher.upgrade().ok_or(EventError::NotInitialized)?;

        if queue.trim().is_empty() {
            return Err(EventError::config("queue name is required to publish"));
        }

        let payload = C::encode(value)?;
        let message = Message::new(payload).with_metadata(metadata.with(SCHEMA_KEY, T::SCHEMA));
        let message_uuid = message.uuid.clone();

        publisher.publish(queue, message).await?;
        self.metrics.message_published(queue);

        debug!(queue, message_uuid = %message_uuid, schema = T::SCHEMA, "Produced event");
        Ok(message_uuid)
    }

    pub async fn publish_json<T>(
        &self,
        queue: &str,
        value: &T,
        metadata: Metadata,
    ) -> Result<String, EventError>
    where
        T: EventSchema + Serialize + DeserializeOwned,
    {
        self.publish::<T, Json>(queue, value, metadata).await
    }

    pub async fn publish_proto<T>(
        &self,
        queue: &str,
        value: &T,
        metadata: Metadata,
    ) -> Result<String, EventError>
    where
        T: EventSchema + prost::Message,
    {
        self.publish::<T, Proto>(queue, value, metadata).await
    }

    /// Whether the publisher is still alive.
    pub fn is_connected(&self) -> bool {
        self.publisher.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CORRELATION_ID_KEY;
    use crate::transport::memory::MemoryBroker;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        id: u32,
    }

    impl EventSchema for OrderCreated {
        const SCHEMA: &'static str = "order_created";
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        source: String,
    }

    impl EventSchema for Ping {
        const SCHEMA: &'static str = "ping";
    }

    fn producer_for(broker: &MemoryBroker) -> (Arc<dyn Publisher>, Producer) {
        let publisher: Arc<dyn Publisher> = Arc::new(broker.clone());
        let producer = Producer::new(&publisher);
        (publisher, producer)
    }

    #[tokio::test]
    async fn test_publish_json_stamps_schema_and_uuid() {
        let broker = MemoryBroker::new();
        let (_publisher, producer) = producer_for(&broker);

        let metadata = Metadata::new().with(CORRELATION_ID_KEY, "corr-9");
        let uuid = producer
            .publish_json("orders", &OrderCreated { id: 7 }, metadata)
            .await
            .unwrap();

        let published = broker.published("orders");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].uuid, uuid);
        assert_eq!(published[0].metadata.schema(), Some("order_created"));
        assert_eq!(published[0].metadata.correlation_id(), Some("corr-9"));
        assert_eq!(published[0].payload, br#"{"id":7}"#.to_vec());
    }

    #[tokio::test]
    async fn test_each_publish_gets_a_fresh_uuid() {
        let broker = MemoryBroker::new();
        let (_publisher, producer) = producer_for(&broker);

        let a = producer
            .publish_json("orders", &OrderCreated { id: 1 }, Metadata::new())
            .await
            .unwrap();
        let b = producer
            .publish_json("orders", &OrderCreated { id: 1 }, Metadata::new())
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_publish_proto() {
        let broker = MemoryBroker::new();
        let (_publisher, producer) = producer_for(&broker);

        let ping = Ping {
            source: "api".to_string(),
        };
        producer.publish_proto("pings", &ping, Metadata::new()).await.unwrap();

        let published = broker.published("pings");
        assert_eq!(published[0].metadata.schema(), Some("ping"));
        assert_eq!(<Proto as Codec<Ping>>::decode(&published[0].payload).unwrap(), ping);
    }

    #[tokio::test]
    async fn test_empty_queue_is_rejected() {
        let broker = MemoryBroker::new();
        let (_publisher, producer) = producer_for(&broker);

        let err = producer
            .publish_json(" ", &OrderCreated { id: 1 }, Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Config(_)));
        assert!(broker.published(" ").is_empty());
    }

    #[tokio::test]
    async fn test_dropped_publisher_is_not_initialized() {
        let broker = MemoryBroker::new();
        let (publisher, producer) = producer_for(&broker);
        assert!(producer.is_connected());

        drop(publisher);

        assert!(!producer.is_connected());
        let err = producer
            .publish_json("orders", &OrderCreated { id: 1 }, Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::NotInitialized));
    }
}
