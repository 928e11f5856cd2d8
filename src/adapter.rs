//! Capability interfaces between an aggregate and a store.
//!
//! Stores never see the aggregate type itself; they work through these
//! narrow adapters. A refresh is driven through a [`StoreLoader`], a commit
//! through a [`StoreWriter`]. Middleware receives the same adapters, so a
//! snapshot layer can restore state or capture it without knowing anything
//! about the concrete aggregate.

use serde_json::Value;

use crate::event::Event;
use crate::fault::Fault;
use crate::registry::EventRegistry;

/// State every adapter can expose: the aggregate key.
pub trait Adapter {
    /// The key of the aggregate being operated on.
    fn key(&self) -> &str;
}

/// An adapter that knows where the aggregate is in its history.
pub trait PositionalAdapter: Adapter {
    /// Current sequence number (count of all events applied in-memory).
    fn sequence_number(&self) -> i64;
}

/// An adapter that can reason about event types and pending writes.
pub trait EventAdapter: PositionalAdapter {
    /// The registry defining this aggregate's events.
    fn registry(&self) -> &EventRegistry;

    /// True when uncommitted events are buffered.
    fn is_dirty(&self) -> bool;
}

/// Mutating adapter a store drives during refresh.
pub trait StoreLoader: EventAdapter {
    /// Replay one already-persisted event into the aggregate.
    ///
    /// Advances both the current and committed sequence counters; never
    /// touches the uncommitted buffer.
    fn replay_event(&mut self, event: Event);

    /// Overlay a snapshot: decode `state` into the aggregate and move both
    /// sequence counters to `sequence`.
    ///
    /// # Errors
    ///
    /// [`Fault::Decode`] when the snapshot state cannot be mapped onto the
    /// aggregate's state type; the aggregate is left unchanged.
    fn restore_snapshot(&mut self, sequence: i64, state: &Value) -> Result<(), Fault>;
}

/// Read-only adapter a store consumes during commit.
pub trait StoreWriter: EventAdapter {
    /// The committed sequence number and the events buffered after it.
    ///
    /// The store appends the events at `committed + 1 ..= committed + n`.
    fn uncommitted(&self) -> (i64, &[Event]);

    /// The aggregate state serialized to a generic record.
    ///
    /// Used by snapshot middleware; the round-trip through a generic record
    /// decouples the captured snapshot from in-memory aliases.
    fn state(&self) -> Result<Value, Fault>;
}
