//! Outbox stage and stores.

use super::Middleware;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

/// Persists outgoing messages.
///
/// Implementations must tolerate the same message id being stored twice, which
/// happens when a message is redelivered after its outputs were recorded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn store_outgoing_message(
        &self,
        event_type: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), EventError>;
}

/// A stored outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub event_type: String,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Process-local outbox, deduplicating by message id.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    records: Mutex<Vec<OutboxRecord>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored records in insertion order.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn store_outgoing_message(
        &self,
        event_type: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), EventError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.iter().any(|r| r.message_id == message_id) {
            return Ok(());
        }
        records.push(OutboxRecord {
            event_type: event_type.to_string(),
            message_id: message_id.to_string(),
            payload: payload.to_vec(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

/// Records every output of the wrapped handler before returning it.
///
/// A failed write fails the whole call.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }
}

impl Middleware for Outbox {
    fn name(&self) -> &'static str {
        "outbox"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(OutboxHandler {
            handler: handler_name.to_string(),
            store: Arc::clone(&self.store),
            next,
        })
    }
}

struct OutboxHandler {
    handler: String,
    store: Arc<dyn OutboxStore>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for OutboxHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let outputs = self.next.handle(message).await?;

        for output in &outputs {
            let event_type = output.metadata.schema().unwrap_or_default();
            if let Err(e) = self
                .store
                .store_outgoing_message(event_type, &output.uuid, &output.payload)
                .await
            {
                error!(
                    handler = %self.handler,
                    message_uuid = %output.uuid,
                    error = %e,
                    "Failed to store outgoing message"
                );
                return Err(e);
            }
            debug!(
                handler = %self.handler,
                message_uuid = %output.uuid,
                event_type,
                "Stored outgoing message"
            );
        }

        Ok(outputs)
    }
}
