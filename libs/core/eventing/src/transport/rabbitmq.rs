//! RabbitMQ transport (lapin).
//!
//! Each topic maps to a durable queue named `<topic>` or `<topic>_<suffix>`.
//! Messages go through the default exchange with the queue name as routing key.
//! Metadata travels as AMQP headers, the uuid as the `message_id` property.
//! The publish channel runs in confirm mode: a publish returns once the broker
//! has taken the message.

use super::{MessageStream, Publisher, Subscriber};
use crate::config::RabbitMqConfig;
use crate::error::EventError;
use crate::message::{Acknowledger, Delivery, Message};
use crate::metadata::Metadata;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

const TRANSPORT: &str = "rabbitmq";
const PREFETCH: u16 = 16;
const PERSISTENT: u8 = 2;

fn amqp_error(e: lapin::Error) -> EventError {
    EventError::transport(TRANSPORT, e)
}

/// Publisher and subscriber over a single AMQP connection.
pub struct RabbitMqTransport {
    connection: Connection,
    channel: Channel,
    config: RabbitMqConfig,
    declared: Mutex<HashSet<String>>,
}

impl RabbitMqTransport {
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self, EventError> {
        let connection = Connection::connect(&config.uri, ConnectionProperties::default())
            .await
            .map_err(amqp_error)?;
        let channel = connection.create_channel().await.map_err(amqp_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(amqp_error)?;

        info!(queue_suffix = ?config.queue_suffix, "Connected to RabbitMQ");

        Ok(Self {
            connection,
            channel,
            config: config.clone(),
            declared: Mutex::new(HashSet::new()),
        })
    }

    async fn declare(&self, channel: &Channel, queue: &str) -> Result<(), EventError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;
        Ok(())
    }

    /// Declare a queue once per transport for publishing.
    async fn ensure_declared(&self, queue: &str) -> Result<(), EventError> {
        let known = self
            .declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue);
        if known {
            return Ok(());
        }

        self.declare(&self.channel, queue).await?;
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string());
        Ok(())
    }
}

#[async_trait]
impl Publisher for RabbitMqTransport {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError> {
        let queue = self.config.queue_name(topic);
        self.ensure_declared(&queue).await?;

        let mut headers = FieldTable::default();
        for (key, value) in message.metadata.iter() {
            headers.insert(ShortString::from(key), AMQPValue::LongString(LongString::from(value)));
        }

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(message.uuid.as_str()))
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish("", &queue, BasicPublishOptions::default(), &message.payload, properties)
            .await
            .map_err(amqp_error)?
            .await
            .map_err(amqp_error)?;
        confirmed(confirmation, &queue)?;

        debug!(queue = %queue, message_uuid = %message.uuid, "Published message");
        Ok(())
    }

    async fn close(&self) -> Result<(), EventError> {
        self.connection.close(200, "closing").await.map_err(amqp_error)
    }
}

#[async_trait]
impl Subscriber for RabbitMqTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn MessageStream>, EventError> {
        let queue = self.config.queue_name(topic);

        // a channel per subscription keeps prefetch and acks independent
        let channel = self.connection.create_channel().await.map_err(amqp_error)?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(amqp_error)?;
        self.declare(&channel, &queue).await?;

        let mut consumer = channel
            .basic_consume(&queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(amqp_error)?;

        info!(queue = %queue, "Subscribed to RabbitMQ queue");

        let (tx, rx) = mpsc::channel(PREFETCH as usize);
        tokio::spawn(async move {
            // keep the channel open for as long as the consumer runs
            let _channel = channel;
            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => to_delivery(delivery),
                    Err(e) => {
                        error!(queue = %queue, error = %e, "RabbitMQ consumer failed");
                        break;
                    }
                };
                if tx.send(delivery).await.is_err() {
                    debug!(queue = %queue, "Subscription dropped, stopping consumer");
                    break;
                }
            }
        });

        Ok(Box::new(ReceiverStream::new(rx)))
    }
}

/// Broker verdict on a publish.
fn confirmed(confirmation: Confirmation, queue: &str) -> Result<(), EventError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(EventError::transport(
            TRANSPORT,
            format!("broker rejected message for queue '{queue}'"),
        )),
        Confirmation::NotRequested => Err(EventError::transport(
            TRANSPORT,
            "publisher confirms are not enabled on the channel",
        )),
    }
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let mut metadata = Metadata::new();
    if let Some(headers) = delivery.properties.headers() {
        for (key, value) in headers.inner() {
            match value {
                AMQPValue::LongString(s) => {
                    metadata.set(key.as_str(), String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => metadata.set(key.as_str(), s.as_str()),
                other => {
                    warn!(header = %key.as_str(), value = ?other, "Skipping non-string header")
                }
            }
        }
    }

    let mut message = Message::new(delivery.data).with_metadata(metadata);
    if let Some(id) = delivery.properties.message_id() {
        message = message.with_uuid(id.as_str());
    }

    Delivery::new(
        message,
        RabbitMqAcknowledger {
            acker: delivery.acker,
        },
    )
}

struct RabbitMqAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for RabbitMqAcknowledger {
    async fn ack(&self) -> Result<(), EventError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(amqp_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        // without requeue the broker drops the message or dead-letters it
        // through the queue's own exchange
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(amqp_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_ack_is_success() {
        assert!(confirmed(Confirmation::Ack(None), "orders").is_ok());
    }

    #[test]
    fn test_broker_nack_is_transport_error() {
        let err = confirmed(Confirmation::Nack(None), "orders").unwrap_err();
        assert!(matches!(err, EventError::Transport { transport: "rabbitmq", .. }));
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_unconfirmed_publish_is_an_error() {
        assert!(confirmed(Confirmation::NotRequested, "orders").is_err());
    }
}
