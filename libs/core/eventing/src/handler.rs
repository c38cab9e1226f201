//! Untyped handlers and handler registration.

use crate::config::QueuePair;
use crate::error::EventError;
use crate::message::Message;
use crate::registry::{EventSchema, SchemaEntry};
use crate::transport::{Publisher, Subscriber};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Processes one message and produces zero or more outgoing messages.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError>;
}

/// Shared, type-erased handler. Middleware wraps and returns these.
pub type BoxHandler = Arc<dyn Handler>;

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        (**self).handle(message).await
    }
}

/// Handler backed by an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Build a handler from an async closure.
///
/// ```ignore
/// let handler = handler_fn(|msg: Message| async move { Ok(vec![msg]) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, EventError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Message>, EventError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        (self.f)(message).await
    }
}

/// Everything needed to bind a handler to a queue.
///
/// Validated by [`Service::register_handler`](crate::Service::register_handler):
/// a handler and a consume queue are required, and a name is required unless a
/// schema is attached (the name then defaults to `<schema>_handler`).
#[derive(Default)]
pub struct HandlerRegistration {
    pub(crate) name: Option<String>,
    pub(crate) consume_queue: String,
    pub(crate) publish_queue: Option<String>,
    pub(crate) handler: Option<BoxHandler>,
    pub(crate) schema: Option<SchemaEntry>,
    pub(crate) subscriber: Option<Arc<dyn Subscriber>>,
    pub(crate) publisher: Option<Arc<dyn Publisher>>,
}

impl HandlerRegistration {
    pub fn new(consume_queue: impl Into<String>) -> Self {
        Self {
            consume_queue: consume_queue.into(),
            ..Default::default()
        }
    }

    /// Registration for a configured queue pair. An empty publish queue means
    /// the handler emits nothing.
    pub fn from_queues(queues: &QueuePair) -> Self {
        let registration = Self::new(queues.consume.clone());
        if queues.publish.is_empty() {
            registration
        } else {
            registration.publish_to(queues.publish.clone())
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn publish_to(mut self, queue: impl Into<String>) -> Self {
        self.publish_queue = Some(queue.into());
        self
    }

    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn boxed_handler(mut self, handler: BoxHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Attach the consumed payload type.
    ///
    /// The type is registered in the service's schema registry and supplies the
    /// default handler name.
    pub fn schema<T, C>(mut self) -> Self
    where
        T: EventSchema,
        C: crate::codec::Codec<T>,
    {
        self.schema = Some(SchemaEntry::of::<T, C>());
        self
    }

    pub(crate) fn schema_entry(mut self, entry: SchemaEntry) -> Self {
        self.schema = Some(entry);
        self
    }

    /// Consume from this subscriber instead of the service's transport.
    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Publish outputs through this publisher instead of the service's transport.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Name the registration resolves to, if it resolves to one.
    pub fn resolved_name(&self) -> Option<String> {
        match (&self.name, &self.schema) {
            (Some(name), _) if !name.trim().is_empty() => Some(name.clone()),
            (_, Some(schema)) => Some(default_handler_name(schema.name())),
            _ => None,
        }
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("consume_queue", &self.consume_queue)
            .field("publish_queue", &self.publish_queue)
            .field("has_handler", &self.handler.is_some())
            .field("schema", &self.schema.as_ref().map(SchemaEntry::name))
            .finish()
    }
}

pub(crate) fn default_handler_name(schema: &str) -> String {
    format!("{schema}_handler")
}

/// Check a registration; on success yields its resolved name and handler.
pub(crate) fn validate(
    registration: &HandlerRegistration,
) -> Result<(String, BoxHandler), EventError> {
    let handler = registration
        .handler
        .clone()
        .ok_or_else(|| EventError::registration("handler is required"))?;

    if registration.consume_queue.trim().is_empty() {
        return Err(EventError::registration("consume queue is required"));
    }

    if let Some(queue) = &registration.publish_queue
        && queue.trim().is_empty()
    {
        return Err(EventError::registration("publish queue must not be empty when set"));
    }

    let name = registration.resolved_name().ok_or_else(|| {
        EventError::registration("handler name is required when no schema is given")
    })?;

    Ok((name, handler))
}
