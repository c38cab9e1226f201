use super::Middleware;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use crate::metrics::EventMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// Turns panics inside the chain into [`EventError::Panicked`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverer;

impl Middleware for Recoverer {
    fn name(&self) -> &'static str {
        "recoverer"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(RecovererHandler {
            metrics: EventMetrics::new(handler_name),
            next,
        })
    }
}

struct RecovererHandler {
    metrics: EventMetrics,
    next: BoxHandler,
}

#[async_trait]
impl Handler for RecovererHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let message_uuid = message.uuid.clone();

        match AssertUnwindSafe(self.next.handle(message)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    handler = %self.metrics.handler(),
                    message_uuid = %message_uuid,
                    panic = %reason,
                    "Recovered from panic while handling message"
                );
                self.metrics.panic_recovered();
                Err(EventError::Panicked(reason))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
