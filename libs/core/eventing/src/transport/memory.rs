//! In-process transport.
//!
//! Every topic keeps a log of all messages published to it. New subscribers
//! first receive the log, then every later message. Each subscriber gets its own
//! copy (fan-out). Acknowledgements are counted but nothing is redelivered, not
//! even a nack that asks for it.

use super::{MessageStream, Publisher, Subscriber};
use crate::error::EventError;
use crate::message::{Acknowledger, Delivery, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

const TRANSPORT: &str = "memory";

#[derive(Default)]
struct Topic {
    log: Vec<Message>,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    requeued: AtomicUsize,
    closed: AtomicBool,
}

/// In-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published to `topic` so far, in order.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Wait until `topic` holds at least `count` messages or `timeout` passes.
    ///
    /// Returns whatever was published by then.
    pub async fn wait_for_published(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published(topic);
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until at least `count` deliveries were acked or nacked.
    pub async fn wait_for_settled(&self, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.acked() + self.nacked();
            if settled >= count || tokio::time::Instant::now() >= deadline {
                return settled;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn acked(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn nacked(&self) -> usize {
        self.inner.nacked.load(Ordering::SeqCst)
    }

    /// Nacks that asked for redelivery.
    pub fn requeued(&self) -> usize {
        self.inner.requeued.load(Ordering::SeqCst)
    }

    /// Reject further publishes and end every open subscription.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        for topic in topics.values_mut() {
            topic.subscribers.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn delivery(&self, message: Message) -> Delivery {
        Delivery::new(
            message,
            MemoryAcknowledger {
                inner: Arc::clone(&self.inner),
            },
        )
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError> {
        if self.is_closed() {
            return Err(EventError::transport(TRANSPORT, "broker is closed"));
        }

        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = topics.entry(topic.to_string()).or_default();

        // drop subscribers whose stream is gone
        entry
            .subscribers
            .retain(|tx| tx.send(self.delivery(message.clone())).is_ok());
        debug!(
            topic,
            message_uuid = %message.uuid,
            subscribers = entry.subscribers.len(),
            "Published message"
        );
        entry.log.push(message);

        Ok(())
    }

    async fn close(&self) -> Result<(), EventError> {
        MemoryBroker::close(self);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn MessageStream>, EventError> {
        if self.is_closed() {
            return Err(EventError::transport(TRANSPORT, "broker is closed"));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = topics.entry(topic.to_string()).or_default();
        for message in &entry.log {
            // the receiver is alive, it is still in scope
            let _ = tx.send(self.delivery(message.clone()));
        }
        entry.subscribers.push(tx);

        Ok(Box::new(UnboundedReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), EventError> {
        MemoryBroker::close(self);
        Ok(())
    }
}

struct MemoryAcknowledger {
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> Result<(), EventError> {
        self.inner.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        self.inner.nacked.fetch_add(1, Ordering::SeqCst);
        if requeue {
            self.inner.requeued.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
