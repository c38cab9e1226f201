//! Transport-agnostic event processing.
//!
//! This library routes messages from a broker through a fixed middleware chain
//! into typed handlers, and publishes what the handlers emit:
//! - **Transports**: Kafka, RabbitMQ, AWS SNS/SQS and an in-process broker behind
//!   one [`Publisher`]/[`Subscriber`] pair
//! - **Typed handlers**: JSON (serde) and protobuf (prost) payloads decoded into
//!   your types, outputs stamped with their schema name
//! - **Middleware**: correlation ids, logging, tracing spans, poison queue,
//!   schema validation, retries with backoff, outbox and panic recovery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────────────────────────────┐   ┌──────────┐
//! │ consume  │   │ recoverer → poison_queue → correlation → logging     │   │ publish  │
//! │  queue   │──▶│   → tracing → schema_validation → retry              │──▶│  queue   │
//! │          │   │   → outbox → handler                                 │   │          │
//! └──────────┘   └──────────────────────────────────────────────────────┘   └──────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eventing::{
//!     EventSchema, EventingConfig, HandlerContext, HandlerRegistration, Outgoing, Service,
//! };
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct UserSignedUp { id: u64, email: String }
//!
//! impl EventSchema for UserSignedUp {
//!     const SCHEMA: &'static str = "user_signed_up";
//! }
//!
//! let mut service = Service::new(EventingConfig::from_env()?).await?;
//!
//! service.register_json_handler(
//!     HandlerRegistration::new("users.signed_up").publish_to("emails.welcome"),
//!     |ctx: HandlerContext<UserSignedUp>| async move {
//!         Ok(vec![Outgoing::new(WelcomeEmail::for_user(ctx.payload()))])
//!     },
//! )?;
//!
//! service.run(shutdown_rx).await?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod middleware;
pub mod producer;
pub mod registry;
pub mod service;
pub mod transport;
pub mod typed;

pub use codec::{Codec, Encoding, Json, Proto};
pub use config::{
    AwsConfig, BackoffStrategy, ConfigError, EventingConfig, KafkaConfig, QueuePair, RabbitMqConfig,
    RetryPolicy, TransportKind,
};
pub use error::{ErrorCategory, EventError, UnprocessableEvent};
pub use handler::{BoxHandler, Handler, HandlerFn, HandlerRegistration, handler_fn};
pub use message::{Acknowledger, Delivery, Message};
pub use metadata::{CORRELATION_ID_KEY, Metadata, SCHEMA_KEY};
pub use middleware::{
    InMemoryOutbox, Middleware, MiddlewareChain, OutboxStore, RulesValidator, Validator,
};
pub use producer::Producer;
pub use registry::{DecodedEvent, EventSchema, SchemaEntry, SchemaRegistry};
pub use service::{Service, ServiceBuilder};
pub use transport::memory::MemoryBroker;
pub use transport::{MessageStream, Publisher, Subscriber, Transport};
pub use typed::{HandlerContext, Outgoing, TypedHandler};
