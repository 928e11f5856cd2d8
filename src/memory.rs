//! In-memory event store, for tests and embedded use.
//!
//! Streams are held as serialized JSON text under a single mutex, so every
//! read round-trips through a non-native representation instead of handing
//! back aliases of stored values.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::fault::Fault;
use crate::registry::EventType;
use crate::store::{KeyValueDriver, KeyValueStore, KeyedEvent};

/// Create a new in-memory event store.
pub fn memory_store() -> KeyValueStore<MemoryDriver> {
    KeyValueStore::new(MemoryDriver::default())
}

/// Key-value driver backed by a process-local map.
#[derive(Default)]
pub struct MemoryDriver {
    streams: Mutex<HashMap<String, Vec<StoredItem>>>,
}

struct StoredItem {
    event_type: EventType,
    body: String,
}

impl MemoryDriver {
    /// Number of events stored for a key.
    pub fn stream_len(&self, key: &str) -> usize {
        let streams = self.streams.lock().expect("memory store mutex poisoned");
        streams.get(key).map_or(0, Vec::len)
    }
}

impl KeyValueDriver for MemoryDriver {
    fn check_sequence(&self, key: &str, sequence: i64) -> Result<bool, Fault> {
        let streams = self.streams.lock().expect("memory store mutex poisoned");
        Ok(streams.get(key).map_or(0, Vec::len) as i64 >= sequence)
    }

    fn fetch_events(&self, key: &str, after: i64) -> Result<Vec<KeyedEvent>, Fault> {
        let streams = self.streams.lock().expect("memory store mutex poisoned");
        let Some(stream) = streams.get(key) else {
            return Ok(Vec::new());
        };

        let skip = after.max(0) as usize;
        let mut result = Vec::with_capacity(stream.len().saturating_sub(skip));
        for (index, item) in stream.iter().enumerate().skip(skip) {
            let data: Value = serde_json::from_str(&item.body)?;
            result.push(KeyedEvent {
                key: key.to_string(),
                sequence: index as i64 + 1,
                event_type: item.event_type.clone(),
                data,
            });
        }
        Ok(result)
    }

    fn put_events(&self, events: Vec<KeyedEvent>) -> Result<(), Fault> {
        let mut streams = self.streams.lock().expect("memory store mutex poisoned");

        // Validate the whole batch before touching any stream, so a
        // conflicting batch writes nothing. Sequence 1 lives at index 0.
        {
            let mut projected: HashMap<&str, i64> = HashMap::new();
            for event in &events {
                let length = projected
                    .entry(event.key.as_str())
                    .or_insert_with(|| streams.get(&event.key).map_or(0, |s| s.len() as i64));
                if *length > event.sequence - 1 {
                    return Err(Fault::concurrency(event.key.clone(), event.sequence));
                }
                *length += 1;
            }
        }

        for event in events {
            let body = serde_json::to_string(&event.data)?;
            streams.entry(event.key).or_default().push(StoredItem {
                event_type: event.event_type,
                body,
            });
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Fault> {
        let mut streams = self.streams.lock().expect("memory store mutex poisoned");
        streams.clear();
        Ok(())
    }
}
