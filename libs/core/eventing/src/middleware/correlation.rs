use super::Middleware;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use crate::metadata::CORRELATION_ID_KEY;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Attaches a correlation id to messages that arrive without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Correlation;

impl Middleware for Correlation {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn wrap(&self, _handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(CorrelationHandler { next })
    }
}

struct CorrelationHandler {
    next: BoxHandler,
}

#[async_trait]
impl Handler for CorrelationHandler {
    async fn handle(&self, mut message: Message) -> Result<Vec<Message>, EventError> {
        if message.metadata.correlation_id().is_none_or(str::is_empty) {
            message
                .metadata
                .set(CORRELATION_ID_KEY, Uuid::new_v4().to_string());
        }
        self.next.handle(message).await
    }
}
