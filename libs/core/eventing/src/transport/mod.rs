//! Message transports.
//!
//! A transport provides a [`Publisher`] and a [`Subscriber`]. The service talks
//! to brokers only through these two traits, so handlers are unaware of which
//! broker is active.
//!
//! | Transport | Feature | Client |
//! |-----------|---------|--------|
//! | memory | always | in-process |
//! | kafka | `kafka` | rdkafka |
//! | rabbitmq | `rabbitmq` | lapin |
//! | aws | `aws` | SNS + SQS |

#[cfg(feature = "aws")]
pub mod aws;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use crate::config::{EventingConfig, TransportKind};
use crate::error::EventError;
use crate::message::{Delivery, Message};
use async_trait::async_trait;
use futures::Stream;
use std::sync::Arc;
use tracing::info;

/// Header carrying the message uuid on brokers without a native id field.
pub const MESSAGE_UUID_HEADER: &str = "_message_uuid";

/// Publishes messages to a topic/queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError>;

    async fn close(&self) -> Result<(), EventError> {
        Ok(())
    }
}

/// Subscribes to a topic/queue.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn MessageStream>, EventError>;

    async fn close(&self) -> Result<(), EventError> {
        Ok(())
    }
}

/// Stream of received messages.
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next message; `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

#[async_trait]
impl<S> MessageStream for S
where
    S: Stream<Item = Delivery> + Send + Unpin,
{
    async fn next(&mut self) -> Option<Delivery> {
        futures::StreamExt::next(self).await
    }
}

/// The publisher/subscriber pair of one transport.
#[derive(Clone)]
pub struct Transport {
    pub kind: TransportKind,
    pub publisher: Arc<dyn Publisher>,
    pub subscriber: Arc<dyn Subscriber>,
}

impl Transport {
    pub fn new(
        kind: TransportKind,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Self {
        Self {
            kind,
            publisher,
            subscriber,
        }
    }

    /// In-process transport around a shared broker.
    pub fn memory(broker: memory::MemoryBroker) -> Self {
        let broker = Arc::new(broker);
        Self::new(TransportKind::Memory, broker.clone(), broker)
    }
}

/// Build the transport selected by the configuration.
///
/// Connection failures and transports compiled out of this build are returned
/// as errors; nothing is retried.
pub async fn build_transport(config: &EventingConfig) -> Result<Transport, EventError> {
    info!(transport = %config.transport, "Building transport");

    match config.transport {
        TransportKind::Memory => Ok(Transport::memory(memory::MemoryBroker::new())),

        #[cfg(feature = "kafka")]
        TransportKind::Kafka => {
            let publisher = Arc::new(kafka::KafkaPublisher::new(&config.kafka)?);
            let subscriber = Arc::new(kafka::KafkaSubscriber::new(config.kafka.clone()));
            Ok(Transport::new(TransportKind::Kafka, publisher, subscriber))
        }

        #[cfg(feature = "rabbitmq")]
        TransportKind::RabbitMq => {
            let transport = Arc::new(rabbitmq::RabbitMqTransport::connect(&config.rabbitmq).await?);
            Ok(Transport::new(TransportKind::RabbitMq, transport.clone(), transport))
        }

        #[cfg(feature = "aws")]
        TransportKind::Aws => {
            let transport = Arc::new(aws::AwsTransport::connect(&config.aws).await?);
            Ok(Transport::new(TransportKind::Aws, transport.clone(), transport))
        }

        #[allow(unreachable_patterns)]
        other => Err(EventError::TransportUnavailable(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_memory_transport() {
        let transport = build_transport(&EventingConfig::default()).await.unwrap();
        assert_eq!(transport.kind, TransportKind::Memory);

        let mut stream = transport.subscriber.subscribe("t").await.unwrap();
        transport.publisher.publish("t", Message::new("hello")).await.unwrap();

        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.message.payload_lossy(), "hello");
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn test_disabled_transport_is_an_error() {
        let config = EventingConfig::new(TransportKind::Kafka);
        let err = build_transport(&config).await.err().unwrap();
        assert!(matches!(err, EventError::TransportUnavailable(ref t) if t == "kafka"));
    }
}
