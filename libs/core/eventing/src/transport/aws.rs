//! AWS transport (SNS for publishing, SQS for consuming).
//!
//! Topics are SNS topics addressed by ARN (`arn:aws:sns:<region>:<account>:<topic>`).
//! Subscribing creates an SQS queue named after the topic and subscribes it to
//! the topic with raw message delivery, so SNS message attributes arrive as SQS
//! message attributes.
//!
//! ## Configuration
//!
//! The clients use the standard AWS SDK credential resolution:
//! - Environment variables: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
//! - IAM roles (EKS IRSA, EC2 instance profile)
//! - Shared credentials file
//!
//! With `AWS_ENDPOINT_URL` set (LocalStack), a missing account id falls back to
//! `000000000000`.

use super::{MESSAGE_UUID_HEADER, MessageStream, Publisher, Subscriber};
use crate::config::AwsConfig;
use crate::error::EventError;
use crate::message::{Acknowledger, Delivery, Message};
use crate::metadata::Metadata;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::types::QueueAttributeName;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const TRANSPORT: &str = "aws";
const ENCODING_ATTRIBUTE: &str = "_payload_encoding";
const BASE64: &str = "base64";
const WAIT_TIME_SECONDS: i32 = 20;
const MAX_MESSAGES: i32 = 10;

fn aws_error(e: impl std::error::Error) -> EventError {
    EventError::transport(TRANSPORT, aws_sdk_sns::error::DisplayErrorContext(e))
}

/// SNS publisher and SQS subscriber sharing one SDK configuration.
pub struct AwsTransport {
    sns: aws_sdk_sns::Client,
    sqs: aws_sdk_sqs::Client,
    config: AwsConfig,
    topics: Mutex<HashMap<String, String>>,
}

impl AwsTransport {
    /// Load SDK configuration and create the clients.
    pub async fn connect(config: &AwsConfig) -> Result<Self, EventError> {
        // fail fast when no ARN can be built
        let account_id = config.resolved_account_id()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        info!(
            region = %config.region,
            account_id = %account_id,
            endpoint = ?config.endpoint_url,
            "AWS transport configured"
        );

        Ok(Self {
            sns: aws_sdk_sns::Client::new(&sdk_config),
            sqs: aws_sdk_sqs::Client::new(&sdk_config),
            config: config.clone(),
            topics: Mutex::new(HashMap::new()),
        })
    }

    /// ARN of `topic`, creating the topic on first use.
    async fn topic_arn(&self, topic: &str) -> Result<String, EventError> {
        let cached = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned();
        if let Some(arn) = cached {
            return Ok(arn);
        }

        let expected = self.config.topic_arn(topic)?;
        let created = self.sns.create_topic().name(topic).send().await.map_err(aws_error)?;
        let arn = created.topic_arn.unwrap_or(expected);

        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), arn.clone());
        Ok(arn)
    }

    /// Create the topic's queue and subscribe it to the topic. Returns the queue URL.
    async fn bind_queue(&self, topic: &str) -> Result<String, EventError> {
        let topic_arn = self.topic_arn(topic).await?;

        let queue_url = self
            .sqs
            .create_queue()
            .queue_name(topic)
            .send()
            .await
            .map_err(aws_error)?
            .queue_url
            .ok_or_else(|| {
                EventError::transport(TRANSPORT, format!("no queue url returned for '{topic}'"))
            })?;

        let queue_arn = self
            .sqs
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(aws_error)?
            .attributes
            .and_then(|mut attributes| attributes.remove(&QueueAttributeName::QueueArn))
            .ok_or_else(|| {
                EventError::transport(TRANSPORT, format!("no queue arn returned for '{topic}'"))
            })?;

        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "sns.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": { "ArnEquals": { "aws:SourceArn": topic_arn } }
            }]
        });
        self.sqs
            .set_queue_attributes()
            .queue_url(&queue_url)
            .attributes(QueueAttributeName::Policy, policy.to_string())
            .send()
            .await
            .map_err(aws_error)?;

        self.sns
            .subscribe()
            .topic_arn(&topic_arn)
            .protocol("sqs")
            .endpoint(&queue_arn)
            .attributes("RawMessageDelivery", "true")
            .send()
            .await
            .map_err(aws_error)?;

        info!(
            topic,
            topic_arn = %topic_arn,
            queue_url = %queue_url,
            "Bound SQS queue to SNS topic"
        );
        Ok(queue_url)
    }
}

#[async_trait]
impl Publisher for AwsTransport {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError> {
        let topic_arn = self.topic_arn(topic).await?;

        let mut attributes = HashMap::new();
        let mut put = |key: &str, value: &str| -> Result<(), EventError> {
            // SNS rejects empty attribute values
            if value.is_empty() {
                return Ok(());
            }
            let attribute = aws_sdk_sns::types::MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(aws_error)?;
            attributes.insert(key.to_string(), attribute);
            Ok(())
        };

        put(MESSAGE_UUID_HEADER, &message.uuid)?;
        for (key, value) in message.metadata.iter() {
            put(key, value)?;
        }

        let body = match std::str::from_utf8(&message.payload) {
            Ok(text) => text.to_string(),
            Err(_) => {
                put(ENCODING_ATTRIBUTE, BASE64)?;
                STANDARD.encode(&message.payload)
            }
        };

        self.sns
            .publish()
            .topic_arn(&topic_arn)
            .message(body)
            .set_message_attributes(Some(attributes))
            .send()
            .await
            .map_err(aws_error)?;

        debug!(topic, message_uuid = %message.uuid, "Published to SNS");
        Ok(())
    }
}

#[async_trait]
impl Subscriber for AwsTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn MessageStream>, EventError> {
        let queue_url = self.bind_queue(topic).await?;

        let (tx, rx) = mpsc::channel(MAX_MESSAGES as usize);
        let sqs = self.sqs.clone();
        tokio::spawn(async move {
            loop {
                let received = sqs
                    .receive_message()
                    .queue_url(&queue_url)
                    .max_number_of_messages(MAX_MESSAGES)
                    .wait_time_seconds(WAIT_TIME_SECONDS)
                    .message_attribute_names("All")
                    .send()
                    .await;

                let messages = match received {
                    Ok(output) => output.messages.unwrap_or_default(),
                    Err(e) => {
                        warn!(queue_url = %queue_url, error = %aws_error(e), "SQS receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for sqs_message in messages {
                    let Some(delivery) = to_delivery(&sqs, &queue_url, sqs_message) else {
                        continue;
                    };
                    if tx.send(delivery).await.is_err() {
                        debug!(queue_url = %queue_url, "Subscription dropped, stopping receiver");
                        return;
                    }
                }
            }
        });

        Ok(Box::new(ReceiverStream::new(rx)))
    }
}

fn to_delivery(
    sqs: &aws_sdk_sqs::Client,
    queue_url: &str,
    sqs_message: aws_sdk_sqs::types::Message,
) -> Option<Delivery> {
    let Some(receipt_handle) = sqs_message.receipt_handle else {
        warn!(queue_url, "SQS message without receipt handle, skipping");
        return None;
    };

    let mut metadata = Metadata::new();
    let mut uuid = None;
    let mut base64 = false;
    for (key, value) in sqs_message.message_attributes.unwrap_or_default() {
        let Some(value) = value.string_value else { continue };
        match key.as_str() {
            MESSAGE_UUID_HEADER => uuid = Some(value),
            ENCODING_ATTRIBUTE => base64 = value == BASE64,
            _ => metadata.set(key, value),
        }
    }

    let body = sqs_message.body.unwrap_or_default();
    let payload = if base64 {
        match STANDARD.decode(body.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(queue_url, error = %e, "Invalid base64 payload, delivering raw body");
                body.into_bytes()
            }
        }
    } else {
        body.into_bytes()
    };

    let message = Message::new(payload).with_metadata(metadata);
    let message = match uuid.or(sqs_message.message_id) {
        Some(uuid) => message.with_uuid(uuid),
        None => message,
    };

    Some(Delivery::new(
        message,
        SqsAcknowledger {
            sqs: sqs.clone(),
            queue_url: queue_url.to_string(),
            receipt_handle,
        },
    ))
}

struct SqsAcknowledger {
    sqs: aws_sdk_sqs::Client,
    queue_url: String,
    receipt_handle: String,
}

#[async_trait]
impl Acknowledger for SqsAcknowledger {
    async fn ack(&self) -> Result<(), EventError> {
        self.sqs
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(aws_error)?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        if !requeue {
            // reappears after the visibility timeout, or moves to the redrive queue
            debug!(queue_url = %self.queue_url, "Message left for the queue's redrive policy");
            return Ok(());
        }

        // visible again immediately
        self.sqs
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(aws_error)?;
        Ok(())
    }
}
