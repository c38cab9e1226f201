use super::Middleware;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Instrument, field, info_span};

/// Runs the wrapped handler inside an `event.handle` span.
///
/// The span is entered for every poll of the inner future and closed when that
/// future completes or is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracer;

impl Middleware for Tracer {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(TracerHandler {
            handler: handler_name.to_string(),
            next,
        })
    }
}

struct TracerHandler {
    handler: String,
    next: BoxHandler,
}

#[async_trait]
impl Handler for TracerHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let span = info_span!(
            "event.handle",
            handler = %self.handler,
            message_uuid = %message.uuid,
            schema = message.metadata.schema().unwrap_or_default(),
            correlation_id = message.metadata.correlation_id().unwrap_or_default(),
            metadata = ?message.metadata,
            outcome = field::Empty,
        );

        let result = self.next.handle(message).instrument(span.clone()).await;

        span.record("outcome", if result.is_ok() { "ok" } else { "error" });
        result
    }
}
