//! Schema validation stage.
//!
//! Resolves `event_message_schema` through the registry, decodes the payload into
//! the registered type and runs the configured [`Validator`]. Any failure becomes
//! an [`UnprocessableEvent`] and the wrapped handler is not called.
//!
//! Messages without a schema are let through with a warning.

use super::Middleware;
use crate::error::{EventError, UnprocessableEvent};
use crate::handler::{BoxHandler, Handler};
use crate::message::Message;
use crate::registry::{DecodedEvent, EventSchema, SchemaRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Validates decoded payloads.
pub trait Validator: Send + Sync {
    fn validate(&self, event: &DecodedEvent) -> Result<(), EventError>;
}

type Rule = Box<dyn Fn(&DecodedEvent) -> Result<(), EventError> + Send + Sync>;

/// [`Validator`] running `validator::Validate` rules per schema.
///
/// Schemas without a rule pass.
#[derive(Default)]
pub struct RulesValidator {
    rules: HashMap<&'static str, Rule>,
}

impl RulesValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate payloads of schema `T::SCHEMA` with `T`'s derived rules.
    pub fn rule<T>(mut self) -> Self
    where
        T: EventSchema + validator::Validate,
    {
        self.rules.insert(
            T::SCHEMA,
            Box::new(|event: &DecodedEvent| match event.downcast_ref::<T>() {
                Some(value) => value
                    .validate()
                    .map_err(|errors| EventError::validation(errors.to_string())),
                None => Err(EventError::validation(format!(
                    "payload is not a {}",
                    std::any::type_name::<T>()
                ))),
            }),
        );
        self
    }
}

impl Validator for RulesValidator {
    fn validate(&self, event: &DecodedEvent) -> Result<(), EventError> {
        match self.rules.get(event.schema()) {
            Some(rule) => rule(event),
            None => Ok(()),
        }
    }
}

/// Rejects messages whose payload does not match their declared schema.
#[derive(Clone)]
pub struct SchemaValidation {
    registry: Arc<SchemaRegistry>,
    validator: Option<Arc<dyn Validator>>,
}

impl SchemaValidation {
    pub fn new(registry: Arc<SchemaRegistry>, validator: Option<Arc<dyn Validator>>) -> Self {
        Self { registry, validator }
    }
}

impl Middleware for SchemaValidation {
    fn name(&self) -> &'static str {
        "schema_validation"
    }

    fn wrap(&self, handler_name: &str, next: BoxHandler) -> BoxHandler {
        Arc::new(ValidationHandler {
            handler: handler_name.to_string(),
            stage: self.clone(),
            next,
        })
    }
}

struct ValidationHandler {
    handler: String,
    stage: SchemaValidation,
    next: BoxHandler,
}

impl ValidationHandler {
    fn check(&self, message: &Message, schema: &str) -> Result<(), EventError> {
        let unprocessable = |reason: String| {
            UnprocessableEvent::new(message.payload.clone(), reason).with_schema(schema)
        };

        let entry = self
            .stage
            .registry
            .lookup(schema)
            .ok_or_else(|| unprocessable(format!("schema '{schema}' is not registered")))?;

        let decoded = entry.decode(&message.payload).map_err(|e| {
            unprocessable(format!("payload does not decode as '{schema}'")).with_cause(e)
        })?;

        if let Some(validator) = &self.stage.validator {
            validator.validate(&decoded).map_err(|e| {
                unprocessable("payload rejected by validator".to_string()).with_cause(e)
            })?;
        }

        Ok(())
    }
}

#[async_trait]
impl Handler for ValidationHandler {
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let Some(schema) = message.metadata.schema() else {
            warn!(
                handler = %self.handler,
                message_uuid = %message.uuid,
                "Message has no schema metadata, skipping validation"
            );
            return self.next.handle(message).await;
        };

        self.check(&message, schema)?;
        self.next.handle(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Json;
    use crate::handler::handler_fn;
    use crate::metadata::{Metadata, SCHEMA_KEY};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use validator::Validate;

    #[derive(Debug, Default, Serialize, Deserialize, Validate)]
    struct Signup {
        #[validate(email)]
        email: String,
    }

    impl EventSchema for Signup {
        const SCHEMA: &'static str = "signup";
    }

    struct Fixture {
        handler: BoxHandler,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(validator: Option<Arc<dyn Validator>>) -> Fixture {
        let registry = Arc::new(SchemaRegistry::new());
        registry.register::<Signup, Json>().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inner: BoxHandler = Arc::new(handler_fn(move |msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(vec![msg]) }
        }));

        Fixture {
            handler: SchemaValidation::new(registry, validator).wrap("test", inner),
            calls,
        }
    }

    fn with_schema(payload: &str, schema: &str) -> Message {
        Message::new(payload).with_metadata(Metadata::new().with(SCHEMA_KEY, schema))
    }

    #[tokio::test]
    async fn test_valid_message_passes_unchanged() {
        let f = fixture(None);
        let message = with_schema(r#"{"email":"a@b.co"}"#, "signup");

        let out = f.handler.handle(message.clone()).await.unwrap();

        assert_eq!(out, vec![message]);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_schema_passes_through() {
        let f = fixture(None);
        f.handler.handle(Message::new("anything")).await.unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_schema_is_unprocessable() {
        let f = fixture(None);
        let err = f
            .handler
            .handle(with_schema("{}", "who.knows"))
            .await
            .unwrap_err();

        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        match err {
            EventError::Unprocessable(e) => {
                assert_eq!(e.payload, b"{}".to_vec());
                assert_eq!(e.schema.as_deref(), Some("who.knows"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_unprocessable() {
        let f = fixture(None);
        let err = f.handler.handle(with_schema("[1,2", "signup")).await.unwrap_err();

        assert!(err.is_unprocessable());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validator_rejection_is_unprocessable() {
        let f = fixture(Some(Arc::new(RulesValidator::new().rule::<Signup>())));

        let err = f
            .handler
            .handle(with_schema(r#"{"email":"not-an-email"}"#, "signup"))
            .await
            .unwrap_err();
        assert!(err.is_unprocessable());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        f.handler
            .handle(with_schema(r#"{"email":"ok@example.com"}"#, "signup"))
            .await
            .unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }
}
