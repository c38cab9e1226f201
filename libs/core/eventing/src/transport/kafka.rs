//! Kafka transport (rdkafka).
//!
//! Metadata travels as record headers; the message uuid is both the record key
//! and the `_message_uuid` header. Offsets are stored when a delivery is acked
//! and committed in the background.
//!
//! Kafka has no per-record negative acknowledgement. A nacked record is logged
//! and skipped: the next acked record on the partition stores an offset past it,
//! so it is not consumed again. Configure a poison queue to keep failed records.

use super::{MESSAGE_UUID_HEADER, MessageStream, Publisher, Subscriber};
use crate::config::KafkaConfig;
use crate::error::EventError;
use crate::message::{Acknowledger, Delivery, Message};
use crate::metadata::Metadata;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

const TRANSPORT: &str = "kafka";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER: usize = 64;

/// Publishes records with a shared `FutureProducer`.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, EventError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| EventError::transport(TRANSPORT, e))?;

        info!(brokers = %config.brokers, "Kafka producer created");
        Ok(Self { producer })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError> {
        let mut headers =
            OwnedHeaders::new_with_capacity(message.metadata.len() + 1).insert(Header {
                key: MESSAGE_UUID_HEADER,
                value: Some(message.uuid.as_str()),
            });
        for (key, value) in message.metadata.iter() {
            headers = headers.insert(Header { key, value: Some(value) });
        }

        let record = FutureRecord::to(topic)
            .key(&message.uuid)
            .payload(&message.payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| EventError::transport(TRANSPORT, e))?;

        debug!(topic, message_uuid = %message.uuid, "Published record");
        Ok(())
    }

    async fn close(&self) -> Result<(), EventError> {
        use rdkafka::producer::Producer as _;
        self.producer
            .flush(Timeout::After(SEND_TIMEOUT))
            .map_err(|e| EventError::transport(TRANSPORT, e))
    }
}

/// Creates one consumer per subscription, all in the configured group.
#[derive(Debug, Clone)]
pub struct KafkaSubscriber {
    config: KafkaConfig,
}

impl KafkaSubscriber {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn consumer(&self) -> Result<StreamConsumer, EventError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| EventError::transport(TRANSPORT, e))
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn MessageStream>, EventError> {
        let consumer = Arc::new(self.consumer()?);
        consumer
            .subscribe(&[topic])
            .map_err(|e| EventError::transport(TRANSPORT, e))?;

        info!(topic, group = %self.config.consumer_group, "Subscribed to Kafka topic");

        let (tx, rx) = mpsc::channel(BUFFER);
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                let received = consumer
                    .recv()
                    .await
                    .map(|record| to_delivery(&consumer, &record));

                let delivery = match received {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Kafka receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if tx.send(delivery).await.is_err() {
                    debug!(topic = %topic, "Subscription dropped, stopping consumer");
                    break;
                }
            }
        });

        Ok(Box::new(ReceiverStream::new(rx)))
    }
}

fn to_delivery(consumer: &Arc<StreamConsumer>, record: &BorrowedMessage<'_>) -> Delivery {
    let mut metadata = Metadata::new();
    let mut uuid = None;

    if let Some(headers) = record.headers() {
        for header in headers.iter() {
            let Some(value) = header.value else { continue };
            let value = String::from_utf8_lossy(value).into_owned();
            if header.key == MESSAGE_UUID_HEADER {
                uuid = Some(value);
            } else {
                metadata.set(header.key, value);
            }
        }
    }

    let mut message =
        Message::new(record.payload().unwrap_or_default().to_vec()).with_metadata(metadata);
    if let Some(uuid) = uuid {
        message = message.with_uuid(uuid);
    }

    Delivery::new(
        message,
        KafkaAcknowledger {
            consumer: Arc::clone(consumer),
            topic: record.topic().to_string(),
            partition: record.partition(),
            offset: record.offset(),
        },
    )
}

struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Acknowledger for KafkaAcknowledger {
    async fn ack(&self) -> Result<(), EventError> {
        // store the next offset to read; auto-commit picks it up
        self.consumer
            .store_offset(&self.topic, self.partition, self.offset + 1)
            .map_err(|e| {
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = self.offset,
                    error = %e,
                    "Failed to store offset"
                );
                EventError::transport(TRANSPORT, e)
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        warn!(
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            requeue,
            "Record nacked, it will be skipped once a later offset is stored"
        );
        Ok(())
    }
}
