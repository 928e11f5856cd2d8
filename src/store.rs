//! Event store contract and the key-value storage engine.
//!
//! [`EventStore`] is the uniform surface aggregates talk to. Most concrete
//! backends do not implement it directly: they implement the four-operation
//! [`KeyValueDriver`] and let [`KeyValueStore`] enforce the ordering and
//! uniqueness rules. The model fits any backend with a dual-part unique
//! key (aggregate key, sequence) and range scans over it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{StoreLoader, StoreWriter};
use crate::event::Event;
use crate::fault::Fault;
use crate::registry::EventType;

/// A store that can load and append per-key event streams.
pub trait EventStore: Send + Sync {
    /// Append the writer's uncommitted events directly after its committed
    /// sequence.
    ///
    /// All events are written durably or none are; partial success is not
    /// permitted.
    ///
    /// # Errors
    ///
    /// - [`Fault::Concurrency`] when any (key, sequence) in the range
    ///   already exists.
    /// - [`Fault::UnknownEvent`] when an event's label is not registered.
    /// - [`Fault::PreconditionMissing`] when the committed sequence is
    ///   positive but holds no event (writing past the end of history).
    fn commit_events(&self, writer: &dyn StoreWriter) -> Result<(), Fault>;

    /// Read events beyond the loader's sequence number and replay each, in
    /// ascending order, through [`StoreLoader::replay_event`].
    ///
    /// # Errors
    ///
    /// [`Fault::DirtyAggregate`] when the loader has uncommitted events.
    fn refresh(&self, loader: &mut dyn StoreLoader) -> Result<(), Fault>;

    /// Release backend resources.
    fn close(&self) -> Result<(), Fault>;
}

/// An event at rest: key, sequence, label, and encoded payload.
///
/// This is the logical persisted record shape for any JSON-shaped backend.
/// Backends with reserved-name constraints may rename fields on the way in
/// and out (`key` → `aggregate_key`, `sequence` → `seq`); such renames are
/// the driver's responsibility and must round-trip transparently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedEvent {
    /// Aggregate key partitioning the stream.
    pub key: String,
    /// 1-based position within the stream.
    pub sequence: i64,
    /// Event type label.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Encoded payload.
    pub data: Value,
}

/// The four operations a concrete storage backend supplies.
///
/// The engine only calls `check_sequence` when a write starts beyond
/// sequence zero. `fetch_events` must be strongly consistent with prior
/// writes from the same process.
pub trait KeyValueDriver: Send + Sync {
    /// True iff an event at (key, sequence) is durable.
    fn check_sequence(&self, key: &str, sequence: i64) -> Result<bool, Fault>;

    /// Return events with sequence greater than `after`, ascending.
    fn fetch_events(&self, key: &str, after: i64) -> Result<Vec<KeyedEvent>, Fault>;

    /// Insert all events atomically with respect to uniqueness on
    /// (key, sequence).
    ///
    /// # Errors
    ///
    /// [`Fault::Concurrency`] with the first offending (key, sequence)
    /// when any of them already exist.
    fn put_events(&self, events: Vec<KeyedEvent>) -> Result<(), Fault>;

    /// Release backend resources.
    fn close(&self) -> Result<(), Fault>;
}

/// Event store composed from a [`KeyValueDriver`].
///
/// Assigns sequence numbers before handing events to the driver, rejects
/// writes whose labels are unknown, and maps stored payloads back through
/// the registry before replay.
///
/// # Examples
///
/// A backend only supplies the four driver operations; the engine does
/// the rest:
///
/// ```
/// use keyfold::{Fault, KeyValueDriver, KeyValueStore, KeyedEvent};
/// use std::collections::HashMap;
/// use std::sync::Mutex;
///
/// /// Driver keeping whole streams in a map, one vector per key.
/// #[derive(Default)]
/// struct VecDriver {
///     streams: Mutex<HashMap<String, Vec<KeyedEvent>>>,
/// }
///
/// impl KeyValueDriver for VecDriver {
///     fn check_sequence(&self, key: &str, sequence: i64) -> Result<bool, Fault> {
///         let streams = self.streams.lock().unwrap();
///         Ok(streams.get(key).map_or(0, |s| s.len() as i64) >= sequence)
///     }
///
///     fn fetch_events(&self, key: &str, after: i64) -> Result<Vec<KeyedEvent>, Fault> {
///         let streams = self.streams.lock().unwrap();
///         Ok(streams
///             .get(key)
///             .map_or(Vec::new(), |s| s[after.max(0) as usize..].to_vec()))
///     }
///
///     fn put_events(&self, events: Vec<KeyedEvent>) -> Result<(), Fault> {
///         let mut streams = self.streams.lock().unwrap();
///         for event in events {
///             let stream = streams.entry(event.key.clone()).or_default();
///             if stream.len() as i64 >= event.sequence {
///                 return Err(Fault::concurrency(event.key, event.sequence));
///             }
///             stream.push(event);
///         }
///         Ok(())
///     }
///
///     fn close(&self) -> Result<(), Fault> {
///         Ok(())
///     }
/// }
///
/// let store = KeyValueStore::new(VecDriver::default());
/// # let _ = store;
/// ```
pub struct KeyValueStore<D> {
    driver: D,
}

impl<D: KeyValueDriver> KeyValueStore<D> {
    /// Wrap a driver in the engine.
    pub fn new(driver: D) -> KeyValueStore<D> {
        KeyValueStore { driver }
    }

    /// Access the underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: KeyValueDriver> EventStore for KeyValueStore<D> {
    fn commit_events(&self, writer: &dyn StoreWriter) -> Result<(), Fault> {
        let key = writer.key();
        let (start, events) = writer.uncommitted();

        // Writing beyond zero requires prior history to append after.
        if start > 0 {
            let exists = self.driver.check_sequence(key, start)?;
            if !exists {
                return Err(Fault::PreconditionMissing {
                    key: key.to_string(),
                    sequence: start,
                });
            }
        }

        let keyed = assign_event_keys(key, start, writer, events)?;
        self.driver.put_events(keyed)
    }

    fn refresh(&self, loader: &mut dyn StoreLoader) -> Result<(), Fault> {
        if loader.is_dirty() {
            return Err(Fault::DirtyAggregate {
                key: loader.key().to_string(),
            });
        }

        let fetched = self
            .driver
            .fetch_events(loader.key(), loader.sequence_number())?;

        // Decode everything first: a decode fault must surface before any
        // replay mutates the aggregate.
        let mut decoded = Vec::with_capacity(fetched.len());
        for item in fetched {
            decoded.push(loader.registry().decode(&item.event_type, item.data)?);
        }

        for event in decoded {
            loader.replay_event(event);
        }

        Ok(())
    }

    fn close(&self) -> Result<(), Fault> {
        self.driver.close()
    }
}

/// Convert buffered events into keyed records at `start + 1 ..= start + n`.
fn assign_event_keys(
    key: &str,
    start: i64,
    writer: &dyn StoreWriter,
    events: &[Event],
) -> Result<Vec<KeyedEvent>, Fault> {
    let registry = writer.registry();
    events
        .iter()
        .enumerate()
        .map(|(index, event)| {
            let (label, found) = registry.type_of(event);
            if !found {
                return Err(Fault::UnknownEvent { label });
            }

            Ok(KeyedEvent {
                key: key.to_string(),
                sequence: start + 1 + index as i64,
                event_type: label,
                data: registry.encode(event)?,
            })
        })
        .collect()
}
