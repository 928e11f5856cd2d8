//! The event currency passed between aggregates, stores, and publishers.
//!
//! Inside a process an event is usually a concrete Rust value produced by a
//! command handler. Events fetched from storage may instead carry a label
//! the local registry no longer knows; those are kept as raw generic
//! records so replay can acknowledge them (the sequence advances) without
//! touching state.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::EventType;

/// A domain event travelling through the runtime.
///
/// An `Event` pairs a type label with either a typed payload (a boxed
/// concrete value) or a raw generic record (an event whose label is not in
/// the registry). Raw events are produced only by the storage decode path;
/// committing one fails with `UnknownEvent`.
pub struct Event {
    label: EventType,
    payload: Payload,
}

enum Payload {
    Typed(Box<dyn Any + Send + Sync>),
    Raw(Value),
}

impl Event {
    /// Wrap a concrete event value, deriving its label from the type name.
    ///
    /// The label is the type's simple name: everything after the last `::`.
    pub fn of<E: Any + Send + Sync>(event: E) -> Event {
        Event {
            label: EventType::of::<E>(),
            payload: Payload::Typed(Box::new(event)),
        }
    }

    /// Wrap a generic record fetched from storage under an unrecognised label.
    pub fn raw(label: EventType, data: Value) -> Event {
        Event {
            label,
            payload: Payload::Raw(data),
        }
    }

    pub(crate) fn from_parts(label: EventType, payload: Box<dyn Any + Send + Sync>) -> Event {
        Event {
            label,
            payload: Payload::Typed(payload),
        }
    }

    /// The event's type label.
    pub fn label(&self) -> &EventType {
        &self.label
    }

    /// Borrow the typed payload as a concrete type, if it is one.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        match &self.payload {
            Payload::Typed(payload) => payload.downcast_ref::<E>(),
            Payload::Raw(_) => None,
        }
    }

    /// True when this event carries a raw record instead of a typed payload.
    pub fn is_raw(&self) -> bool {
        matches!(self.payload, Payload::Raw(_))
    }

    /// The raw record, when this event is an unrecognised one.
    pub fn raw_data(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Raw(data) => Some(data),
            Payload::Typed(_) => None,
        }
    }

    pub(crate) fn typed_payload(&self) -> Option<&(dyn Any + Send + Sync)> {
        match &self.payload {
            Payload::Typed(payload) => Some(payload.as_ref()),
            Payload::Raw(_) => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Typed(_) => f.debug_tuple("Event").field(&self.label).finish(),
            Payload::Raw(data) => f
                .debug_struct("Event")
                .field("label", &self.label)
                .field("raw", data)
                .finish(),
        }
    }
}

/// A record carrying an event across a distribution boundary.
///
/// The payload is a generic JSON record so it survives any text or binary
/// serialization a transport applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedEvent {
    /// Bounded-context name of the registry the event belongs to.
    pub domain: String,
    /// The event's type label.
    pub event_type: EventType,
    /// Aggregate key the event was committed under.
    pub key: String,
    /// Sequence number within the aggregate's stream.
    pub sequence: i64,
    /// Encoded payload.
    pub data: Value,
}
