//! Typed handler adapters.
//!
//! [`TypedHandler`] decodes the inbound payload into `I`, calls a user function
//! with a [`HandlerContext`], and encodes each returned [`Outgoing<O>`] back into a
//! wire message stamped with `O::SCHEMA`. The codec parameter picks the wire
//! encoding, so JSON and protobuf handlers share one implementation.

use crate::codec::Codec;
use crate::error::{EventError, UnprocessableEvent};
use crate::handler::Handler;
use crate::message::Message;
use crate::metadata::{Metadata, SCHEMA_KEY};
use crate::registry::EventSchema;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Read-only view handed to a typed handler.
#[derive(Debug)]
pub struct HandlerContext<T> {
    payload: T,
    metadata: Metadata,
    message_id: String,
}

impl<T> HandlerContext<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Independent copy of the inbound metadata, safe to modify.
    pub fn clone_metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

/// A value to emit, with optional explicit metadata.
///
/// Without explicit metadata the emitted message carries a copy of the inbound
/// message's metadata.
#[derive(Debug, Clone)]
pub struct Outgoing<T> {
    pub value: T,
    pub metadata: Option<Metadata>,
}

impl<T> Outgoing<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            metadata: None,
        }
    }

    pub fn with_metadata(value: T, metadata: Metadata) -> Self {
        Self {
            value,
            metadata: Some(metadata),
        }
    }
}

impl<T> From<T> for Outgoing<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// Handler adapter from typed functions to wire messages.
pub struct TypedHandler<I, O, C, F> {
    f: F,
    _types: PhantomData<fn(I, C) -> O>,
}

impl<I, O, C, F, Fut> TypedHandler<I, O, C, F>
where
    I: EventSchema,
    O: EventSchema,
    C: Codec<I> + Codec<O>,
    F: Fn(HandlerContext<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Outgoing<O>>, EventError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }

    fn decode(&self, message: &Message) -> Result<I, EventError> {
        <C as Codec<I>>::decode(&message.payload).map_err(|err| {
            let reason = format!("cannot decode payload as {}", I::SCHEMA);
            EventError::from(
                UnprocessableEvent::new(message.payload.clone(), reason)
                    .with_schema(I::SCHEMA)
                    .with_cause(err),
            )
        })
    }

    fn encode_all(
        outputs: Vec<Outgoing<O>>,
        inbound: &Metadata,
    ) -> Result<Vec<Message>, EventError> {
        outputs
            .into_iter()
            .map(|out| {
                let payload = <C as Codec<O>>::encode(&out.value)?;
                let mut metadata = out.metadata.unwrap_or_else(|| inbound.clone());
                metadata.set(SCHEMA_KEY, O::SCHEMA);
                Ok(Message::new(payload).with_metadata(metadata))
            })
            .collect()
    }
}

#[async_trait]
impl<I, O, C, F, Fut> Handler for TypedHandler<I, O, C, F>
where
    I: EventSchema,
    O: EventSchema,
    C: Codec<I> + Codec<O>,
    F: Fn(HandlerContext<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Outgoing<O>>, EventError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<Vec<Message>, EventError> {
        let payload = self.decode(&message)?;
        let Message { uuid, metadata, .. } = message;

        let ctx = HandlerContext {
            payload,
            metadata: metadata.clone(),
            message_id: uuid,
        };

        // errors pass through untouched so outer stages can classify them
        let outputs = (self.f)(ctx).await?;

        Self::encode_all(outputs, &metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Json, Proto};
    use crate::metadata::CORRELATION_ID_KEY;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Signup {
        id: u32,
        email: String,
    }

    impl EventSchema for Signup {
        const SCHEMA: &'static str = "signup";
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Welcome {
        id: u32,
        greeting: String,
    }

    impl EventSchema for Welcome {
        const SCHEMA: &'static str = "welcome";
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Counter {
        #[prost(uint64, tag = "1")]
        value: u64,
    }

    impl EventSchema for Counter {
        const SCHEMA: &'static str = "counter";
    }

    fn inbound(payload: &[u8]) -> Message {
        Message::new(payload.to_vec())
            .with_metadata(Metadata::new().with(CORRELATION_ID_KEY, "corr-1"))
    }

    #[tokio::test]
    async fn test_json_handler_emits_typed_output() {
        let handler = TypedHandler::<Signup, Welcome, Json, _>::new(
            |ctx: HandlerContext<Signup>| async move {
                let signup = ctx.payload();
                Ok(vec![Outgoing::new(Welcome {
                    id: signup.id,
                    greeting: format!("hi {}", signup.email),
                })])
            },
        );

        let message = inbound(br#"{"id":7,"email":"a@b.c"}"#);
        let out = handler.handle(message).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].metadata.schema(), Some("welcome"));
        assert_eq!(out[0].metadata.correlation_id(), Some("corr-1"));
        let welcome: Welcome = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(welcome.id, 7);
        assert_eq!(welcome.greeting, "hi a@b.c");
    }

    #[tokio::test]
    async fn test_output_metadata_is_isolated_from_inbound() {
        let handler = TypedHandler::<Signup, Welcome, Json, _>::new(
            |ctx: HandlerContext<Signup>| async move {
                let mut metadata = ctx.clone_metadata();
                metadata.set("stage", "two");
                assert!(!ctx.metadata().contains_key("stage"));
                Ok(vec![
                    Outgoing::with_metadata(Welcome::default(), metadata),
                    Outgoing::new(Welcome::default()),
                ])
            },
        );

        let out = handler.handle(inbound(br#"{"id":1,"email":""}"#)).await.unwrap();

        assert_eq!(out[0].metadata.get("stage"), Some("two"));
        assert!(!out[1].metadata.contains_key("stage"));
        assert_ne!(out[0].uuid, out[1].uuid);
    }

    #[tokio::test]
    async fn test_decode_failure_is_unprocessable_and_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = TypedHandler::<Signup, Welcome, Json, _>::new(
            move |_ctx: HandlerContext<Signup>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(vec![]) }
            },
        );

        let err = handler.handle(inbound(b"not json")).await.unwrap_err();

        assert!(err.is_unprocessable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match err {
            EventError::Unprocessable(inner) => {
                assert_eq!(inner.payload, b"not json".to_vec());
                assert_eq!(inner.schema.as_deref(), Some("signup"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_is_not_wrapped() {
        let handler = TypedHandler::<Signup, Welcome, Json, _>::new(
            |_ctx: HandlerContext<Signup>| async move {
                Err::<Vec<Outgoing<Welcome>>, _>(EventError::validation("email missing"))
            },
        );

        let err = handler.handle(inbound(br#"{"id":1,"email":""}"#)).await.unwrap_err();
        assert!(matches!(err, EventError::Validation(msg) if msg == "email missing"));
    }

    #[tokio::test]
    async fn test_proto_handler_round_trip() {
        let handler = TypedHandler::<Counter, Counter, Proto, _>::new(
            |ctx: HandlerContext<Counter>| async move {
                Ok(vec![Outgoing::new(Counter {
                    value: ctx.payload().value + 1,
                })])
            },
        );

        let payload = <Proto as Codec<Counter>>::encode(&Counter { value: 41 }).unwrap();
        let out = handler.handle(inbound(&payload)).await.unwrap();

        let decoded = <Proto as Codec<Counter>>::decode(&out[0].payload).unwrap();
        assert_eq!(decoded, Counter { value: 42 });
        assert_eq!(out[0].metadata.schema(), Some("counter"));
    }
}
