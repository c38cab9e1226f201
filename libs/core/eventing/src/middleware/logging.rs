use super::Middleware;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Logs every message and its outcome at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Middleware for Logging {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(LoggingHandler {
            handler: handler_name.to_string(),
            next,
        })
    }
}

struct LoggingHandler {
    handler: String,
    next: BoxHandler,
}

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let message_uuid = message.uuid.clone();
        debug!(
            handler = %self.handler,
            message_uuid = %message_uuid,
            payload = %message.payload_lossy(),
            metadata = ?message.metadata,
            "Handling message"
        );

        let result = self.next.handle(message).await;

        match &result {
            Ok(outputs) => debug!(
                handler = %self.handler,
                message_uuid = %message_uuid,
                outputs = outputs.len(),
                "Message handled"
            ),
            Err(e) => debug!(
                handler = %self.handler,
                message_uuid = %message_uuid,
                error = %e,
                "Message handling failed"
            ),
        }

        result
    }
}
