//! Handler middleware.
//!
//! A [`Middleware`] wraps a handler and returns a decorated one. A
//! [`MiddlewareChain`] applies its stages so that the first stage pushed is the
//! outermost. The service installs the stages in this order:
//!
//! ```text
//! recoverer → poison_queue → correlation → logging → tracing
//!           → schema_validation → retry → outbox → handler
//! ```
//!
//! - the recoverer is outermost and catches panics from every stage
//! - the poison queue sits outside correlation and dead-letters messages as received
//! - schema validation rejects malformed input before any business logic runs
//! - retry sits inside the poison queue, so only messages that exhausted retries
//!   or failed permanently get dead-lettered
//! - the outbox wraps the handler directly and records only its outputs

mod correlation;
mod logging;
mod outbox;
mod poison;
mod recoverer;
mod retry;
mod tracer;
mod validation;

pub use correlation::Correlation;
pub use logging::Logging;
pub use outbox::{InMemoryOutbox, Outbox, OutboxRecord, OutboxStore};
pub use poison::{PoisonClassifier, PoisonQueue, default_poison_classifier};
pub use recoverer::Recoverer;
pub use retry::Retry;
pub use tracer::Tracer;
pub use validation::{RulesValidator, SchemaValidation, Validator};

#[cfg(test)]
pub use outbox::MockOutboxStore;

use crate::handler::BoxHandler;
use std::fmt;
use std::sync::Arc;

/// A handler decorator.
pub trait Middleware: Send + Sync {
    /// Stage name, used for introspection and logs.
    fn name(&self) -> &'static str;

    /// Wrap `next` for the handler registered as `handler_name`.
    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler;
}

/// Ordered list of middleware, outermost first.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage inside the ones already present.
    pub fn push(&mut self, stage: impl Middleware + 'static) {
        self.stages.push(Arc::new(stage));
    }

    pub fn with(mut self, stage: impl Middleware + 'static) -> Self {
        self.push(stage);
        self
    }

    /// Installed stage names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Wrap a handler with every stage.
    pub fn apply(&self, handler_name: &str, handler: BoxHandler) -> BoxHandler {
        self.stages
            .iter()
            .rev()
            .fold(handler, |next, stage| stage.wrap(handler_name, next))
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
