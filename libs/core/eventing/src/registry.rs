//! Schema registry.
//!
//! Maps a stable schema name to the Rust type that payloads with that name decode
//! into. Schema validation resolves names through it, and typed handlers register
//! their types when they are installed.
//!
//! Schema names come from [`EventSchema::SCHEMA`], a constant chosen by the type's
//! author, so two types can only collide when they claim the same name. Such a
//! collision is rejected at registration time.

use crate::codec::{Codec, Encoding};
use crate::error::EventError;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// A type that can travel as an event payload.
///
/// ```ignore
/// #[derive(Default, Serialize, Deserialize)]
/// struct UserCreated { id: u64 }
///
/// impl EventSchema for UserCreated {
///     const SCHEMA: &'static str = "user.created";
/// }
/// ```
pub trait EventSchema: Default + Send + Sync + 'static {
    /// Wire name stamped into `event_message_schema`.
    const SCHEMA: &'static str;
}

type AnyEvent = Box<dyn Any + Send + Sync>;
type DecodeFn = fn(&[u8]) -> Result<AnyEvent, EventError>;
type FactoryFn = fn() -> AnyEvent;

/// A payload decoded through the registry.
pub struct DecodedEvent {
    schema: &'static str,
    value: AnyEvent,
}

impl DecodedEvent {
    pub fn schema(&self) -> &'static str {
        self.schema
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Registry entry for one schema.
#[derive(Clone)]
pub struct SchemaEntry {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    encoding: Encoding,
    decode: DecodeFn,
    factory: FactoryFn,
}

impl SchemaEntry {
    /// Entry for `T` encoded with codec `C`.
    pub fn of<T, C>() -> Self
    where
        T: EventSchema,
        C: Codec<T>,
    {
        Self {
            name: T::SCHEMA,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            encoding: C::ENCODING,
            decode: decode_boxed::<T, C>,
            factory: fresh_boxed::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decode a payload into a fresh instance of the registered type.
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedEvent, EventError> {
        let value = (self.decode)(payload)?;
        Ok(DecodedEvent {
            schema: self.name,
            value,
        })
    }

    /// A fresh zero-valued instance; never shared between callers.
    pub fn new_instance(&self) -> DecodedEvent {
        DecodedEvent {
            schema: self.name,
            value: (self.factory)(),
        }
    }
}

impl fmt::Debug for SchemaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaEntry")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("encoding", &self.encoding)
            .finish()
    }
}

fn decode_boxed<T, C>(payload: &[u8]) -> Result<AnyEvent, EventError>
where
    T: EventSchema,
    C: Codec<T>,
{
    Ok(Box::new(C::decode(payload)?))
}

fn fresh_boxed<T: EventSchema>() -> AnyEvent {
    Box::new(T::default())
}

/// Concurrent schema registry.
///
/// Read-mostly: lookups take a shared lock, registrations an exclusive one.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: RwLock<HashMap<&'static str, SchemaEntry>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its schema name.
    ///
    /// Registering the same type twice is a no-op. Registering a different type
    /// under a name that is already taken fails.
    pub fn register<T, C>(&self) -> Result<(), EventError>
    where
        T: EventSchema,
        C: Codec<T>,
    {
        self.insert(SchemaEntry::of::<T, C>())
    }

    pub fn insert(&self, entry: SchemaEntry) -> Result<(), EventError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = entries.get(entry.name) {
            if existing.type_id == entry.type_id {
                return Ok(());
            }
            return Err(EventError::registration(format!(
                "schema '{}' is already registered for {} (attempted {})",
                entry.name, existing.type_name, entry.type_name
            )));
        }

        tracing::debug!(schema = entry.name, type_name = entry.type_name, "Registered schema");
        entries.insert(entry.name, entry);
        Ok(())
    }

    pub fn lookup(&self, schema: &str) -> Option<SchemaEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(schema)
            .cloned()
    }

    pub fn contains(&self, schema: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(schema)
    }

    /// Decode a payload by schema name.
    ///
    /// Returns `None` when the schema is unknown.
    pub fn decode(&self, schema: &str, payload: &[u8]) -> Option<Result<DecodedEvent, EventError>> {
        self.lookup(schema).map(|entry| entry.decode(payload))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered schema names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        names.sort_unstable();
        names
    }
}
