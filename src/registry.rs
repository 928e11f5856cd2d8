//! Domain-scoped type registries for events and commands.
//!
//! A registry maps a type label (the simple type name) to a decode factory
//! that revives stored generic records into concrete values. Registries are
//! populated once at process start and then shared immutably; reads are
//! unsynchronised by that convention.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decode::from_value_weak;
use crate::event::Event;
use crate::fault::Fault;

/// Strip any module path qualifier, keeping only the trailing simple name.
pub(crate) fn simple_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

/// Label identifying an event shape within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// The label for a concrete event type: its simple type name.
    pub fn of<E: 'static>() -> EventType {
        EventType(simple_name(std::any::type_name::<E>()).to_string())
    }

    /// The label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(label: &str) -> Self {
        EventType(label.to_string())
    }
}

impl From<String> for EventType {
    fn from(label: String) -> Self {
        EventType(label)
    }
}

/// Label identifying a command shape within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandType(String);

impl CommandType {
    /// The label for a concrete command type: its simple type name.
    pub fn of<C: 'static>() -> CommandType {
        CommandType(simple_name(std::any::type_name::<C>()).to_string())
    }

    /// The label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandType {
    fn from(label: &str) -> Self {
        CommandType(label.to_string())
    }
}

/// Two distinct types registered under one simple name in one domain.
///
/// Registration is idempotent for the same type; a different shape under
/// the same label is always a caller error, surfaced at wire-up time.
#[derive(Debug, thiserror::Error)]
#[error("label {label} in domain {domain} is already registered to {existing}, refusing {incoming}")]
pub struct DuplicateLabel {
    /// Domain the collision occurred in.
    pub domain: String,
    /// The colliding label.
    pub label: String,
    /// Full type name of the already-registered shape.
    pub existing: &'static str,
    /// Full type name of the shape being registered.
    pub incoming: &'static str,
}

struct EventEntry {
    type_id: TypeId,
    full_name: &'static str,
    decode: fn(Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error>,
    encode: fn(&(dyn Any + Send + Sync)) -> Result<Value, serde_json::Error>,
}

fn decode_entry<E>(value: Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error>
where
    E: DeserializeOwned + Any + Send + Sync,
{
    Ok(Box::new(from_value_weak::<E>(value)?))
}

fn encode_entry<E>(payload: &(dyn Any + Send + Sync)) -> Result<Value, serde_json::Error>
where
    E: Serialize + Any,
{
    let event = payload
        .downcast_ref::<E>()
        .expect("encode entry invoked with a payload of the registered type");
    serde_json::to_value(event)
}

/// Registry of the event shapes known to one domain (bounded context).
///
/// Register every event shape at process start, then share the registry as
/// an `Arc<EventRegistry>`; it is immutable afterwards.
///
/// # Examples
///
/// ```
/// use keyfold::{EventRegistry, EventType};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderShipped {
///     carrier: String,
/// }
///
/// let mut registry = EventRegistry::new("Shipping");
/// let label = registry.register::<OrderShipped>().expect("no collisions");
/// assert_eq!(label.as_str(), "OrderShipped");
///
/// let event = registry
///     .decode(&label, json!({"carrier": "acme"}))
///     .expect("decode should succeed");
/// assert_eq!(event.downcast_ref::<OrderShipped>().unwrap().carrier, "acme");
///
/// // Labels the registry has never seen decode to raw events.
/// let raw = registry
///     .decode(&EventType::from("RetiredShape"), json!({"x": 1}))
///     .expect("unknown labels still decode");
/// assert!(raw.is_raw());
/// ```
pub struct EventRegistry {
    domain: String,
    entries: HashMap<EventType, EventEntry>,
}

impl EventRegistry {
    /// Create an empty registry for the named domain.
    pub fn new(domain: impl Into<String>) -> EventRegistry {
        EventRegistry {
            domain: domain.into(),
            entries: HashMap::new(),
        }
    }

    /// Domain this registry contains events for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register an event shape, returning its label.
    ///
    /// Idempotent for the same type. Registering a different type whose
    /// simple name collides with an existing entry fails with
    /// [`DuplicateLabel`].
    pub fn register<E>(&mut self) -> Result<EventType, DuplicateLabel>
    where
        E: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let label = EventType::of::<E>();
        if let Some(existing) = self.entries.get(&label) {
            if existing.type_id != TypeId::of::<E>() {
                return Err(DuplicateLabel {
                    domain: self.domain.clone(),
                    label: label.as_str().to_string(),
                    existing: existing.full_name,
                    incoming: std::any::type_name::<E>(),
                });
            }
            return Ok(label);
        }

        self.entries.insert(
            label.clone(),
            EventEntry {
                type_id: TypeId::of::<E>(),
                full_name: std::any::type_name::<E>(),
                decode: decode_entry::<E>,
                encode: encode_entry::<E>,
            },
        );
        Ok(label)
    }

    /// True when the label names a registered event shape.
    pub fn contains(&self, label: &EventType) -> bool {
        self.entries.contains_key(label)
    }

    /// Revive a stored record into an [`Event`].
    ///
    /// A registered label decodes into its concrete type (weakly typed, see
    /// [`crate::from_value_weak`]). An unregistered label yields a raw
    /// event so callers can still acknowledge it.
    ///
    /// # Errors
    ///
    /// [`Fault::Decode`] when the record cannot be mapped onto the
    /// registered shape.
    pub fn decode(&self, label: &EventType, data: Value) -> Result<Event, Fault> {
        match self.entries.get(label) {
            Some(entry) => {
                let payload = (entry.decode)(data)?;
                Ok(Event::from_parts(label.clone(), payload))
            }
            None => Ok(Event::raw(label.clone(), data)),
        }
    }

    /// Determine the label of an event and whether the registry knows it.
    ///
    /// "Knows" means the label is registered *and* the payload is of the
    /// registered type; raw events are never known.
    pub fn type_of(&self, event: &Event) -> (EventType, bool) {
        let label = event.label().clone();
        let found = match event.typed_payload() {
            Some(payload) => self
                .entries
                .get(&label)
                .is_some_and(|entry| entry.type_id == payload.type_id()),
            None => false,
        };
        (label, found)
    }

    /// Encode an event's payload to a generic record for storage/transport.
    ///
    /// # Errors
    ///
    /// [`Fault::UnknownEvent`] when the payload's type is not registered.
    pub fn encode(&self, event: &Event) -> Result<Value, Fault> {
        match event.typed_payload() {
            Some(payload) => {
                let entry = self
                    .entries
                    .get(event.label())
                    .filter(|entry| entry.type_id == payload.type_id())
                    .ok_or_else(|| Fault::UnknownEvent {
                        label: event.label().clone(),
                    })?;
                Ok((entry.encode)(payload)?)
            }
            None => Ok(event
                .raw_data()
                .cloned()
                .unwrap_or(Value::Null)),
        }
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("domain", &self.domain)
            .field("events", &self.entries.len())
            .finish()
    }
}

struct CommandEntry {
    type_id: TypeId,
    full_name: &'static str,
    decode: fn(Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error>,
}

/// Registry of the command shapes known to one domain.
///
/// Commands are never persisted; the registry exists so routing surfaces
/// (HTTP endpoints, queue consumers) can revive a named command from a
/// generic record before handing it to an aggregate.
pub struct CommandRegistry {
    domain: String,
    entries: HashMap<CommandType, CommandEntry>,
}

impl CommandRegistry {
    /// Create an empty registry for the named domain.
    pub fn new(domain: impl Into<String>) -> CommandRegistry {
        CommandRegistry {
            domain: domain.into(),
            entries: HashMap::new(),
        }
    }

    /// Domain this registry contains commands for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Register a command shape, returning its label.
    pub fn register<C>(&mut self) -> Result<CommandType, DuplicateLabel>
    where
        C: DeserializeOwned + Any + Send + Sync,
    {
        let label = CommandType::of::<C>();
        if let Some(existing) = self.entries.get(&label) {
            if existing.type_id != TypeId::of::<C>() {
                return Err(DuplicateLabel {
                    domain: self.domain.clone(),
                    label: label.as_str().to_string(),
                    existing: existing.full_name,
                    incoming: std::any::type_name::<C>(),
                });
            }
            return Ok(label);
        }

        self.entries.insert(
            label.clone(),
            CommandEntry {
                type_id: TypeId::of::<C>(),
                full_name: std::any::type_name::<C>(),
                decode: decode_entry::<C>,
            },
        );
        Ok(label)
    }

    /// True when the label names a registered command shape.
    pub fn contains(&self, label: &CommandType) -> bool {
        self.entries.contains_key(label)
    }

    /// Revive a generic record into the registered command type.
    ///
    /// # Errors
    ///
    /// [`Fault::UnsupportedCommand`] for an unregistered label;
    /// [`Fault::Decode`] when the record cannot be mapped.
    pub fn decode(
        &self,
        label: &CommandType,
        data: Value,
    ) -> Result<Box<dyn Any + Send + Sync>, Fault> {
        let entry = self
            .entries
            .get(label)
            .ok_or_else(|| Fault::UnsupportedCommand {
                command: label.as_str().to_string(),
            })?;
        Ok((entry.decode)(data)?)
    }

    /// The label of a concrete command type and whether it is registered.
    pub fn label_of<C: Any>(&self) -> (CommandType, bool) {
        let label = CommandType::of::<C>();
        let found = self
            .entries
            .get(&label)
            .is_some_and(|entry| entry.type_id == TypeId::of::<C>());
        (label, found)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("domain", &self.domain)
            .field("commands", &self.entries.len())
            .finish()
    }
}
