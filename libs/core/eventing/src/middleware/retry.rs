use super::Middleware;
use crate::config::RetryPolicy;
use crate::error::EventError;
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use crate::metrics::EventMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Retries transient failures with backoff.
///
/// The handler is called at most `max_retries + 1` times per message. Permanent
/// errors are returned after the first attempt.
#[derive(Debug, Clone)]
pub struct Retry {
    policy: RetryPolicy,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Middleware for Retry {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(RetryHandler {
            policy: self.policy.clone(),
            metrics: EventMetrics::new(handler_name),
            next,
        })
    }
}

struct RetryHandler {
    policy: RetryPolicy,
    metrics: EventMetrics,
    next: BoxHandler,
}

#[async_trait]
impl Handler for RetryHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let mut retry_count = 0;

        loop {
            let err = match self.next.handle(message.clone()).await {
                Ok(outputs) => return Ok(outputs),
                Err(err) => err,
            };

            if !err.is_retryable() || retry_count >= self.policy.max_retries {
                return Err(err);
            }

            let delay = self.policy.delay(retry_count);
            retry_count += 1;
            warn!(
                handler = %self.metrics.handler(),
                message_uuid = %message.uuid,
                retry = retry_count,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, retrying"
            );
            self.metrics.message_retried();
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    fn failing_until(successes_after: u32, calls: Arc<AtomicU32>) -> BoxHandler {
        Arc::new(handler_fn(move |msg: Message| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n > successes_after {
                    Ok(vec![msg])
                } else {
                    Err(EventError::transient(format!("attempt {n} failed")))
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_always_failing_is_called_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Retry::new(policy(3)).wrap("test", failing_until(u32::MAX, calls.clone()));

        let err = handler.handle(Message::new("x")).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.to_string(), "handler error: attempt 4 failed");
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Retry::new(policy(2)).wrap("test", failing_until(2, calls.clone()));

        let out = handler.handle(Message::new("x")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let inner: BoxHandler = Arc::new(handler_fn(move |_msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(EventError::validation("bad email")) }
        }));

        let handler = Retry::new(policy(5)).wrap("test", inner);
        assert!(handler.handle(Message::new("x")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_attempt_sees_original_message() {
        let inner: BoxHandler = Arc::new(handler_fn(|mut msg: Message| async move {
            msg.payload.push(b'!');
            if msg.payload == b"x!" {
                Err(EventError::transient("again"))
            } else {
                Ok(vec![msg])
            }
        }));

        // every attempt starts from "x", so every attempt fails the same way
        let handler = Retry::new(policy(2)).wrap("test", inner);
        assert!(handler.handle(Message::new("x")).await.is_err());
    }
}
