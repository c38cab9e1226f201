//! Poison (dead-letter) queue stage.

use super::Middleware;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use crate::metrics::EventMetrics;
use crate::transport::Publisher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Decides whether a failed message belongs on the poison queue.
pub type PoisonClassifier = Arc<dyn Fn(&EventError) -> bool + Send + Sync>;

/// Unprocessable events and domain validation failures are poison.
pub fn default_poison_classifier(err: &EventError) -> bool {
    matches!(err, EventError::Unprocessable(_) | EventError::Validation(_))
}

/// Republishes classified failures to the poison queue and reports success.
///
/// Errors the classifier does not match are returned unchanged. If the poison
/// publish itself fails, that error is returned instead.
#[derive(Clone)]
pub struct PoisonQueue {
    queue: String,
    publisher: Arc<dyn Publisher>,
    classifier: PoisonClassifier,
}

impl PoisonQueue {
    pub fn new(queue: impl Into<String>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            queue: queue.into(),
            publisher,
            classifier: Arc::new(default_poison_classifier),
        }
    }

    pub fn with_classifier(mut self, classifier: PoisonClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Middleware for PoisonQueue {
    fn name(&self) -> &'static str {
        "poison_queue"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(PoisonHandler {
            stage: self.clone(),
            metrics: EventMetrics::new(handler_name),
            next,
        })
    }
}

struct PoisonHandler {
    stage: PoisonQueue,
    metrics: EventMetrics,
    next: BoxHandler,
}

#[async_trait]
impl Handler for PoisonHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let original = message.clone();

        let err = match self.next.handle(message).await {
            Ok(outputs) => return Ok(outputs),
            Err(err) => err,
        };

        if !(self.stage.classifier)(&err) {
            return Err(err);
        }

        let message_uuid = original.uuid.clone();
        if let Err(publish_err) = self.stage.publisher.publish(&self.stage.queue, original).await {
            error!(
                handler = %self.metrics.handler(),
                message_uuid = %message_uuid,
                poison_queue = %self.stage.queue,
                error = %publish_err,
                cause = %err,
                "Failed to publish message to poison queue"
            );
            return Err(publish_err);
        }

        warn!(
            handler = %self.metrics.handler(),
            message_uuid = %message_uuid,
            poison_queue = %self.stage.queue,
            error = %err,
            "Message moved to poison queue"
        );
        self.metrics.message_poisoned();

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnprocessableEvent;
    use crate::handler::handler_fn;
    use crate::metadata::{Metadata, SCHEMA_KEY};
    use crate::transport::memory::MemoryBroker;

    fn failing_with(make: fn() -> EventError) -> BoxHandler {
        Arc::new(handler_fn(move |_msg: Message| async move { Err(make()) }))
    }

    #[tokio::test]
    async fn test_unprocessable_goes_to_poison_queue_verbatim() {
        let broker = MemoryBroker::new();
        let stage = PoisonQueue::new("dead", Arc::new(broker.clone()));
        let handler = stage.wrap(
            "test",
            failing_with(|| UnprocessableEvent::new(b"{}".to_vec(), "unknown schema").into()),
        );

        let message =
            Message::new(r#"{"id":1}"#).with_metadata(Metadata::new().with(SCHEMA_KEY, "x"));
        let out = handler.handle(message.clone()).await.unwrap();

        assert!(out.is_empty());
        assert_eq!(broker.published("dead"), vec![message]);
    }

    #[tokio::test]
    async fn test_transient_errors_propagate() {
        let broker = MemoryBroker::new();
        let handler = PoisonQueue::new("dead", Arc::new(broker.clone()))
            .wrap("test", failing_with(|| EventError::transient("timeout")));

        let err = handler.handle(Message::new("x")).await.unwrap_err();

        assert!(matches!(err, EventError::Handler { .. }));
        assert!(broker.published("dead").is_empty());
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let broker = MemoryBroker::new();
        let handler = PoisonQueue::new("dead", Arc::new(broker.clone()))
            .with_classifier(Arc::new(|_err: &EventError| true))
            .wrap("test", failing_with(|| EventError::transient("timeout")));

        assert!(handler.handle(Message::new("x")).await.unwrap().is_empty());
        assert_eq!(broker.published("dead").len(), 1);
    }

    #[tokio::test]
    async fn test_poison_publish_failure_is_returned() {
        let broker = MemoryBroker::new();
        broker.close();
        let handler = PoisonQueue::new("dead", Arc::new(broker.clone()))
            .wrap("test", failing_with(|| EventError::validation("bad")));

        let err = handler.handle(Message::new("x")).await.unwrap_err();
        assert!(matches!(err, EventError::Transport { .. }));
    }

    #[test]
    fn test_default_classifier() {
        assert!(default_poison_classifier(&EventError::validation("x")));
        assert!(default_poison_classifier(&UnprocessableEvent::new(Vec::new(), "x").into()));
        assert!(!default_poison_classifier(&EventError::transient("x")));
        assert!(!default_poison_classifier(&EventError::Panicked("x".into())));
    }
}
