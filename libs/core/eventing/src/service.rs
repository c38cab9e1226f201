//! Service: handler registration and per-queue consumption loops.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventing::{EventingConfig, HandlerContext, HandlerRegistration, Outgoing, Service};
//! use tokio::sync::watch;
//!
//! let config = EventingConfig::from_env()?;
//! let mut service = Service::builder(config.clone())
//!     .with_outbox(outbox)
//!     .build()
//!     .await?;
//!
//! service.register_json_handler(
//!     HandlerRegistration::from_queues(&config.queues),
//!     |ctx: HandlerContext<OrderCreated>| async move {
//!         Ok(vec![Outgoing::new(OrderConfirmed { id: ctx.payload().id })])
//!     },
//! )?;
//!
//! let producer = service.producer();
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(service.run(shutdown_rx));
//! ```

use crate::codec::{Json, Proto};
use crate::config::EventingConfig;
use crate::error::EventError;
use crate::handler::{self, BoxHandler, HandlerRegistration};
use crate::message::{Delivery, Message};
use crate::metrics::EventMetrics;
use crate::middleware::{
    Correlation, Logging, MiddlewareChain, Outbox, OutboxStore, PoisonClassifier, PoisonQueue,
    Recoverer, Retry, SchemaValidation, Tracer, Validator,
};
use crate::producer::Producer;
use crate::registry::{EventSchema, SchemaRegistry};
use crate::transport::{self, MessageStream, Publisher, Subscriber, Transport};
use crate::typed::{HandlerContext, Outgoing, TypedHandler};
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Builds a [`Service`]: transport, collaborators and the middleware chain.
pub struct ServiceBuilder {
    config: EventingConfig,
    transport: Option<Transport>,
    outbox: Option<Arc<dyn OutboxStore>>,
    validator: Option<Arc<dyn Validator>>,
    poison_classifier: Option<PoisonClassifier>,
}

impl ServiceBuilder {
    pub fn new(config: EventingConfig) -> Self {
        Self {
            config,
            transport: None,
            outbox: None,
            validator: None,
            poison_classifier: None,
        }
    }

    /// Use an existing transport instead of building one from the config.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persist handler outputs through `store` (adds the outbox stage).
    pub fn with_outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(store);
        self
    }

    /// Validate decoded payloads in the schema validation stage.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Decide which errors send a message to the poison queue.
    pub fn with_poison_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&EventError) -> bool + Send + Sync + 'static,
    {
        self.poison_classifier = Some(Arc::new(classifier));
        self
    }

    /// Connect the transport and assemble the middleware chain.
    ///
    /// Fails when the transport cannot be built; no handler can be registered
    /// before this succeeds.
    pub async fn build(self) -> Result<Service, EventError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::build_transport(&self.config).await?,
        };

        let registry = Arc::new(SchemaRegistry::new());

        let mut chain = MiddlewareChain::new().with(Recoverer);

        // dead-lettered copies must be the messages as received, before correlation
        if let Some(queue) = self
            .config
            .poison_queue
            .as_deref()
            .filter(|q| !q.trim().is_empty())
        {
            let mut poison = PoisonQueue::new(queue, Arc::clone(&transport.publisher));
            if let Some(classifier) = self.poison_classifier {
                poison = poison.with_classifier(classifier);
            }
            chain.push(poison);
        }

        chain.push(Correlation);
        chain.push(Logging);
        chain.push(Tracer);
        chain.push(SchemaValidation::new(Arc::clone(&registry), self.validator));
        chain.push(Retry::new(self.config.retry.clone()));

        if let Some(store) = self.outbox {
            chain.push(Outbox::new(store));
        }

        info!(
            transport = %transport.kind,
            middleware = ?chain.names(),
            poison_queue = ?self.config.poison_queue,
            "Event service configured"
        );

        Ok(Service {
            config: Arc::new(self.config),
            transport,
            registry,
            chain,
            routes: Vec::new(),
        })
    }
}

/// One registered handler bound to its queues.
struct Route {
    name: String,
    consume_queue: String,
    publish_queue: Option<String>,
    handler: BoxHandler,
    subscriber: Arc<dyn Subscriber>,
    publisher: Arc<dyn Publisher>,
    metrics: EventMetrics,
}

/// Event router: owns the transport, the schema registry, the middleware chain
/// and the registered handlers.
pub struct Service {
    config: Arc<EventingConfig>,
    transport: Transport,
    registry: Arc<SchemaRegistry>,
    chain: MiddlewareChain,
    routes: Vec<Route>,
}

impl Service {
    pub fn builder(config: EventingConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Build a service with no optional collaborators.
    pub async fn new(config: EventingConfig) -> Result<Self, EventError> {
        ServiceBuilder::new(config).build().await
    }

    pub fn config(&self) -> &EventingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Installed middleware, outermost first.
    pub fn middleware(&self) -> Vec<&'static str> {
        self.chain.names()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.routes.iter().map(|route| route.name.as_str()).collect()
    }

    /// Producer bound to the service's publisher.
    pub fn producer(&self) -> Producer {
        Producer::new(&self.transport.publisher)
    }

    /// Register a handler.
    ///
    /// The registration is validated in full before anything is recorded: on
    /// error the service is left exactly as it was.
    pub fn register_handler(
        &mut self,
        registration: HandlerRegistration,
    ) -> Result<(), EventError> {
        let (name, handler) = handler::validate(&registration)?;

        if self.routes.iter().any(|route| route.name == name) {
            return Err(EventError::registration(format!(
                "handler '{name}' is already registered"
            )));
        }

        if let Some(schema) = &registration.schema {
            self.registry.insert(schema.clone())?;
        }

        let HandlerRegistration {
            consume_queue,
            publish_queue,
            subscriber,
            publisher,
            ..
        } = registration;

        info!(
            handler = %name,
            consume_queue = %consume_queue,
            publish_queue = ?publish_queue,
            "Registered handler"
        );

        self.routes.push(Route {
            handler: self.chain.apply(&name, handler),
            metrics: EventMetrics::new(name.as_str()),
            name,
            consume_queue,
            publish_queue,
            subscriber: subscriber.unwrap_or_else(|| Arc::clone(&self.transport.subscriber)),
            publisher: publisher.unwrap_or_else(|| Arc::clone(&self.transport.publisher)),
        });
        Ok(())
    }

    /// Register a JSON handler consuming `I` and emitting `O`.
    ///
    /// `I` is added to the schema registry; the handler name defaults to
    /// `<I::SCHEMA>_handler`.
    pub fn register_json_handler<I, O, F, Fut>(
        &mut self,
        registration: HandlerRegistration,
        f: F,
    ) -> Result<(), EventError>
    where
        I: EventSchema + Serialize + DeserializeOwned,
        O: EventSchema + Serialize + DeserializeOwned,
        F: Fn(HandlerContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Outgoing<O>>, EventError>> + Send + 'static,
    {
        self.register_handler(
            registration
                .handler(TypedHandler::<I, O, Json, F>::new(f))
                .schema::<I, Json>(),
        )
    }

    /// Register a protobuf handler consuming `I` and emitting `O`.
    pub fn register_proto_handler<I, O, F, Fut>(
        &mut self,
        registration: HandlerRegistration,
        f: F,
    ) -> Result<(), EventError>
    where
        I: EventSchema + prost::Message,
        O: EventSchema + prost::Message,
        F: Fn(HandlerContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Outgoing<O>>, EventError>> + Send + 'static,
    {
        self.register_handler(
            registration
                .handler(TypedHandler::<I, O, Proto, F>::new(f))
                .schema::<I, Proto>(),
        )
    }

    /// Consume every registered queue until `shutdown` flips to `true`.
    ///
    /// All subscriptions are opened before any message is processed; a failed
    /// subscription aborts startup. Each queue is processed sequentially by its
    /// own task. In-flight messages finish before the task stops.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), EventError> {
        let Service {
            transport, routes, ..
        } = self;

        if routes.is_empty() {
            warn!("No handlers registered, nothing to consume");
        }

        let mut subscriptions = Vec::with_capacity(routes.len());
        for route in routes {
            let stream = route.subscriber.subscribe(&route.consume_queue).await?;
            subscriptions.push((route, stream));
        }

        info!(
            handlers = subscriptions.len(),
            transport = %transport.kind,
            "Starting event service"
        );

        let mut tasks = JoinSet::new();
        for (route, stream) in subscriptions {
            tasks.spawn(consume(route, stream, shutdown.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task failed");
            }
        }

        if let Err(e) = transport.publisher.close().await {
            warn!(error = %e, "Failed to close publisher");
        }

        info!("Event service stopped");
        Ok(())
    }
}

async fn consume(
    route: Route,
    mut stream: Box<dyn MessageStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(handler = %route.name, queue = %route.consume_queue, "Consumer started");

    loop {
        if *shutdown.borrow() {
            info!(handler = %route.name, "Received shutdown signal, stopping consumer");
            break;
        }

        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // a dropped sender also means stop
                if changed.is_err() {
                    info!(handler = %route.name, "Shutdown sender dropped, stopping consumer");
                    break;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let Some(delivery) = next else {
            info!(handler = %route.name, queue = %route.consume_queue, "Subscription closed");
            break;
        };

        route.process(delivery).await;
    }
}

impl Route {
    async fn process(&self, delivery: Delivery) {
        let (message, acker) = delivery.into_parts();
        let message_uuid = message.uuid.clone();

        self.metrics.message_received();
        let started = Instant::now();

        match self.dispatch(message).await {
            Ok(()) => {
                self.metrics.message_processed(started.elapsed());
                if let Err(e) = acker.ack().await {
                    warn!(
                        handler = %self.name,
                        message_uuid = %message_uuid,
                        error = %e,
                        "Failed to ack message"
                    );
                }
            }
            Err(err) => {
                self.metrics.message_failed(&err.category().to_string());
                error!(
                    handler = %self.name,
                    queue = %self.consume_queue,
                    message_uuid = %message_uuid,
                    error = %err,
                    "Message processing failed"
                );
                // permanent failures are not redelivered
                if let Err(e) = acker.nack(err.is_retryable()).await {
                    warn!(
                        handler = %self.name,
                        message_uuid = %message_uuid,
                        error = %e,
                        "Failed to nack message"
                    );
                }
            }
        }
    }

    /// Run the chain and publish its outputs.
    async fn dispatch(&self, message: Message) -> Result<(), EventError> {
        let outputs = self.handler.handle(message).await?;
        if outputs.is_empty() {
            return Ok(());
        }

        let queue = self.publish_queue.as_deref().ok_or_else(|| {
            EventError::config(format!(
                "handler '{}' produced {} message(s) but has no publish queue",
                self.name,
                outputs.len()
            ))
        })?;

        for output in outputs {
            let output_uuid = output.uuid.clone();
            self.publisher.publish(queue, output).await?;
            self.metrics.message_published(queue);
            debug!(handler = %self.name, queue, message_uuid = %output_uuid, "Published output");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, TransportKind};
    use crate::handler::handler_fn;
    use crate::transport::memory::MemoryBroker;
    use std::time::Duration;

    async fn memory_service(config: EventingConfig) -> (MemoryBroker, Service) {
        let broker = MemoryBroker::new();
        let service = Service::builder(config)
            .with_transport(Transport::memory(broker.clone()))
            .build()
            .await
            .unwrap();
        (broker, service)
    }

    fn echo() -> HandlerRegistration {
        HandlerRegistration::new("in")
            .name("echo")
            .handler(handler_fn(|msg: Message| async move { Ok(vec![msg]) }))
    }

    #[tokio::test]
    async fn test_default_chain_order() {
        let (_, service) = memory_service(EventingConfig::default()).await;
        assert_eq!(
            service.middleware(),
            vec!["recoverer", "correlation", "logging", "tracing", "schema_validation", "retry"]
        );
    }

    #[tokio::test]
    async fn test_full_chain_order() {
        let config = EventingConfig::default().with_poison_queue("dead");
        let broker = MemoryBroker::new();
        let service = Service::builder(config)
            .with_transport(Transport::memory(broker))
            .with_outbox(Arc::new(crate::middleware::InMemoryOutbox::new()))
            .build()
            .await
            .unwrap();

        assert_eq!(
            service.middleware(),
            vec![
                "recoverer",
                "poison_queue",
                "correlation",
                "logging",
                "tracing",
                "schema_validation",
                "retry",
                "outbox"
            ]
        );
    }

    #[tokio::test]
    async fn test_build_from_config_uses_memory_transport() {
        let service = Service::new(EventingConfig::new(TransportKind::Memory)).await.unwrap();
        assert_eq!(service.transport().kind, TransportKind::Memory);
        assert!(service.handler_names().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let (_, mut service) = memory_service(EventingConfig::default()).await;
        service.register_handler(echo()).unwrap();

        let err = service.register_handler(echo()).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(service.handler_names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_invalid_registration_leaves_service_untouched() {
        let (_, mut service) = memory_service(EventingConfig::default()).await;

        assert!(service.register_handler(HandlerRegistration::new("in").name("h")).is_err());
        assert!(service.handler_names().is_empty());
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_outputs_without_publish_queue_are_nacked() {
        let config = EventingConfig::default().with_retry_policy(RetryPolicy::none());
        let (broker, mut service) = memory_service(config).await;
        service.register_handler(echo()).unwrap();

        broker.publish("in", Message::new("x")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(service.run(rx));

        assert_eq!(broker.wait_for_settled(1, Duration::from_secs(2)).await, 1);
        assert_eq!(broker.nacked(), 1);
        // a config error is permanent, so no redelivery is requested
        assert_eq!(broker.requeued(), 0);

        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (broker, mut service) = memory_service(EventingConfig::default()).await;
        service.register_handler(echo().publish_to("out")).unwrap();

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(service.run(rx));

        broker.publish("in", Message::new("x")).await.unwrap();
        assert_eq!(broker.wait_for_published("out", 1, Duration::from_secs(2)).await.len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(broker.acked(), 1);
    }
}
