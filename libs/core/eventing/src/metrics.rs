//! Metrics for event handlers.
//!
//! Emitted through the `metrics` facade. Nothing is recorded until the host
//! application installs a recorder.

use metrics::{counter, histogram};
use std::time::Duration;

/// Per-handler metrics helper
#[derive(Debug, Clone)]
pub struct EventMetrics {
    /// Handler name for labeling
    handler: String,
}

impl EventMetrics {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
        }
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Record a message being received
    pub fn message_received(&self) {
        counter!(
            "eventing_messages_received_total",
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a message processed successfully
    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "eventing_messages_processed_total",
            "handler" => self.handler.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "eventing_handler_duration_seconds",
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message failing the chain
    pub fn message_failed(&self, category: &str) {
        counter!(
            "eventing_messages_processed_total",
            "handler" => self.handler.clone(),
            "status" => "failed",
            "category" => category.to_string()
        )
        .increment(1);
    }

    /// Record a retry attempt
    pub fn message_retried(&self) {
        counter!(
            "eventing_messages_retried_total",
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a message sent to the poison queue
    pub fn message_poisoned(&self) {
        counter!(
            "eventing_messages_poisoned_total",
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record an output published
    pub fn message_published(&self, queue: &str) {
        counter!(
            "eventing_messages_published_total",
            "handler" => self.handler.clone(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a recovered panic
    pub fn panic_recovered(&self) {
        counter!(
            "eventing_panics_recovered_total",
            "handler" => self.handler.clone()
        )
        .increment(1);
    }
}
