//! Test support: a fixture aggregate, store doubles, and the storage
//! compliance suite.
//!
//! The compliance suite is the behavioural contract a storage backend must
//! satisfy. Backend crates run it from their own tests:
//!
//! ```
//! use keyfold::{testkit, EventStore};
//! use std::sync::Arc;
//!
//! testkit::check_standard_suite("memory", || {
//!     let store: Arc<dyn EventStore> = Arc::new(keyfold::memory_store());
//!     (store, Box::new(|| {}))
//! });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::{Adapter, EventAdapter, PositionalAdapter, StoreLoader, StoreWriter};
use crate::aggregate::{AggregateRoot, AggregateState, Dispatch};
use crate::event::Event;
use crate::fault::Fault;
use crate::registry::{EventRegistry, EventType};
use crate::store::EventStore;

/// Counter aggregate used across tests: counts toward a target value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleCounter {
    /// How far the counter has counted.
    pub current_count: i64,
    /// The value the counter counts toward.
    pub target_value: i64,
}

/// Sets the counter's target value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeEvent {
    /// The value the counter will count toward.
    pub target_value: i64,
}

/// Moves the counter forward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementEvent {
    /// Amount to add to the current count.
    pub increment_by: i64,
}

/// An event shape no replay route is defined for. Applying it advances
/// the sequence without touching state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnmappedEvent {}

/// Command: set the counter's target.
#[derive(Debug, Clone)]
pub struct InitializeCounter {
    /// Target value to initialize with.
    pub target_value: i64,
}

/// Command: move the counter forward.
#[derive(Debug, Clone)]
pub struct IncrementCounter {
    /// Amount to increment by.
    pub increment_by: i64,
}

impl AggregateState for SimpleCounter {
    fn wire(dispatch: &mut Dispatch<Self>) {
        dispatch.on_event::<InitializeEvent>(|state, event| {
            state.target_value = event.target_value;
        });
        dispatch.on_event::<IncrementEvent>(|state, event| {
            state.current_count += event.increment_by;
        });

        dispatch.on_command::<InitializeCounter>(|state, key, command| {
            if state.target_value != 0 {
                return Err(Fault::domain(key, "counter_already_initialized"));
            }
            Ok(vec![Event::of(InitializeEvent {
                target_value: command.target_value,
            })])
        });
        dispatch.on_command::<IncrementCounter>(|state, key, command| {
            if state.current_count >= state.target_value {
                return Err(Fault::domain(key, "counter_at_target"));
            }
            Ok(vec![Event::of(IncrementEvent {
                increment_by: command.increment_by,
            })])
        });
    }
}

/// Registry with the counter fixture's events, in the `Testing` domain.
pub fn test_registry() -> Arc<EventRegistry> {
    let mut registry = EventRegistry::new("Testing");
    registry
        .register::<InitializeEvent>()
        .expect("fixture registration cannot collide");
    registry
        .register::<IncrementEvent>()
        .expect("fixture registration cannot collide");
    Arc::new(registry)
}

/// A key unlikely to collide with earlier suite runs against a shared
/// backend.
pub fn unique_key(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// An event black-hole: commits succeed without persisting anything and
/// refresh never changes state. For stateless tests only.
pub struct NullStore;

impl EventStore for NullStore {
    fn commit_events(&self, _writer: &dyn StoreWriter) -> Result<(), Fault> {
        Ok(())
    }

    fn refresh(&self, _loader: &mut dyn StoreLoader) -> Result<(), Fault> {
        Ok(())
    }

    fn close(&self) -> Result<(), Fault> {
        Ok(())
    }
}

/// A store failing every operation with a caller-supplied fault.
pub struct ErrorStore {
    fault: Box<dyn Fn() -> Fault + Send + Sync>,
}

impl ErrorStore {
    /// Create a store whose every operation fails with `fault()`.
    pub fn new(fault: impl Fn() -> Fault + Send + Sync + 'static) -> ErrorStore {
        ErrorStore {
            fault: Box::new(fault),
        }
    }
}

impl EventStore for ErrorStore {
    fn commit_events(&self, _writer: &dyn StoreWriter) -> Result<(), Fault> {
        Err((self.fault)())
    }

    fn refresh(&self, _loader: &mut dyn StoreLoader) -> Result<(), Fault> {
        Err((self.fault)())
    }

    fn close(&self) -> Result<(), Fault> {
        Err((self.fault)())
    }
}

/// One commit observed by a [`TestStore`].
#[derive(Debug, Clone)]
pub struct CommitRecord {
    /// Key of the committing aggregate.
    pub key: String,
    /// Committed sequence the events were appended after.
    pub offset: i64,
    /// Labels of the committed events, in order.
    pub labels: Vec<EventType>,
    /// Serialized aggregate state at commit time.
    pub state: Value,
}

struct WhenState {
    offset: i64,
    events: Option<Vec<(EventType, Value)>>,
    snapshot: Option<Value>,
}

/// Observing store double: records commits and replays preconfigured
/// refresh responses.
#[derive(Default)]
pub struct TestStore {
    history: Mutex<Vec<CommitRecord>>,
    whens: Mutex<HashMap<String, WhenState>>,
}

impl TestStore {
    /// Create an empty test store.
    pub fn new() -> TestStore {
        TestStore::default()
    }

    /// Configure a refresh for `key` to replay `events` from `offset`.
    pub fn when_events(&self, key: &str, offset: i64, events: Vec<(EventType, Value)>) {
        self.whens.lock().expect("test store mutex poisoned").insert(
            key.to_string(),
            WhenState {
                offset,
                events: Some(events),
                snapshot: None,
            },
        );
    }

    /// Configure a refresh for `key` to restore a snapshot at `offset`.
    pub fn when_snapshot(&self, key: &str, offset: i64, state: Value) {
        self.whens.lock().expect("test store mutex poisoned").insert(
            key.to_string(),
            WhenState {
                offset,
                events: None,
                snapshot: Some(state),
            },
        );
    }

    /// Every commit observed so far.
    pub fn history(&self) -> Vec<CommitRecord> {
        self.history
            .lock()
            .expect("test store mutex poisoned")
            .clone()
    }
}

impl EventStore for TestStore {
    fn commit_events(&self, writer: &dyn StoreWriter) -> Result<(), Fault> {
        let (offset, events) = writer.uncommitted();
        let record = CommitRecord {
            key: writer.key().to_string(),
            offset,
            labels: events.iter().map(|event| event.label().clone()).collect(),
            state: writer.state()?,
        };
        self.history
            .lock()
            .expect("test store mutex poisoned")
            .push(record);
        Ok(())
    }

    fn refresh(&self, loader: &mut dyn StoreLoader) -> Result<(), Fault> {
        let whens = self.whens.lock().expect("test store mutex poisoned");
        let Some(when) = whens.get(loader.key()) else {
            if loader.sequence_number() == 0 {
                return Ok(());
            }
            return Err(Fault::backend(std::io::Error::other(format!(
                "no refresh configured for {} at sequence {}",
                loader.key(),
                loader.sequence_number()
            ))));
        };

        if let Some(events) = &when.events {
            if when.offset != loader.sequence_number() {
                return Err(Fault::backend(std::io::Error::other(format!(
                    "configured offset {} does not match sequence {}",
                    when.offset,
                    loader.sequence_number()
                ))));
            }

            let mut decoded = Vec::with_capacity(events.len());
            for (label, data) in events {
                decoded.push(loader.registry().decode(label, data.clone())?);
            }
            for event in decoded {
                loader.replay_event(event);
            }
        } else if let Some(snapshot) = &when.snapshot {
            loader.restore_snapshot(when.offset, snapshot)?;
        }

        Ok(())
    }

    fn close(&self) -> Result<(), Fault> {
        Ok(())
    }
}

fn execute<F>(provider: &F, check: impl FnOnce(Arc<dyn EventStore>))
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    let (store, teardown) = provider();
    check(store);
    teardown();
}

/// Run every compliance check against a store provider.
///
/// Panics (test-style) on the first violated property.
pub fn check_standard_suite<F>(name: &str, provider: F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    tracing::debug!(name, "running store compliance suite");

    check_startup_shutdown(&provider);
    check_write_read_new(&provider);
    check_unmapped_event(&provider);
    check_concurrency_validation(&provider);
    check_write_past_end(&provider);
}

/// The store starts and closes cleanly.
pub fn check_startup_shutdown<F>(provider: &F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    execute(provider, |store| {
        store.close().expect("close should succeed");
    });
}

/// Events written through one aggregate are read back by another.
pub fn check_write_read_new<F>(provider: &F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    execute(provider, |store| {
        let key = unique_key("compliance");

        let mut writer: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store.clone());
        writer.refresh().expect("refresh should succeed");
        writer.apply(InitializeEvent { target_value: 3 });
        writer.commit().expect("commit should succeed");

        let mut reader: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store);
        reader.refresh().expect("refresh should succeed");
        assert_eq!(reader.state().target_value, 3, "target value should be 3");
        assert_eq!(reader.sequence_number(), 1);
    });
}

/// Committing an event missing from the registry fails and writes nothing.
pub fn check_unmapped_event<F>(provider: &F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    execute(provider, |store| {
        let key = unique_key("compliance");

        let mut aggregate: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store.clone());
        aggregate.refresh().expect("refresh should succeed");
        aggregate.apply(UnmappedEvent {});

        let fault = aggregate
            .commit()
            .expect_err("committing an unmapped event must fail");
        assert!(
            matches!(fault, Fault::UnknownEvent { .. }),
            "expected UnknownEvent, got {fault:?}"
        );

        let mut reader: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store);
        reader.refresh().expect("refresh should succeed");
        assert_eq!(reader.sequence_number(), 0, "nothing may be written");
    });
}

/// Two writers race for one sequence; exactly one wins.
pub fn check_concurrency_validation<F>(provider: &F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    execute(provider, |store| {
        let key = unique_key("compliance");

        let mut first: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store.clone());
        first.refresh().expect("refresh should succeed");
        first.apply(InitializeEvent { target_value: 3 });

        let mut second: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store);
        second.refresh().expect("refresh should succeed");
        second.apply(InitializeEvent { target_value: 5 });

        first.commit().expect("the first commit should succeed");
        let fault = second
            .commit()
            .expect_err("the second commit must collide");
        assert!(
            fault.is_concurrency(),
            "expected a concurrency fault, got {fault:?}"
        );
    });
}

/// Writing after a sequence with no prior event is rejected.
pub fn check_write_past_end<F>(provider: &F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    execute(provider, |store| {
        let writer = FakeStoreWriter {
            key: unique_key("compliance"),
            registry: test_registry(),
            origin: 3,
            events: vec![Event::of(IncrementEvent { increment_by: 1 })],
        };

        let result = store.commit_events(&writer);
        assert!(
            result.is_err(),
            "writing past the end of history must be rejected"
        );
    });
}

/// Large streams survive a write/reload cycle intact.
///
/// Heavier than the standard suite; backends with per-call costs may want
/// to run it separately.
pub fn check_bulk_insert_and_reload<F>(provider: &F)
where
    F: Fn() -> (Arc<dyn EventStore>, Box<dyn FnOnce()>),
{
    execute(provider, |store| {
        let key = unique_key("compliance-bulk");

        let mut writer: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store.clone());
        writer.refresh().expect("refresh should succeed");
        for _ in 0..1000 {
            writer.apply(IncrementEvent { increment_by: 1 });
        }
        writer.commit().expect("bulk commit should succeed");

        let mut reader: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize(&key, test_registry(), store);
        reader.refresh().expect("refresh should succeed");
        assert_eq!(reader.state().current_count, 1000);
        assert_eq!(reader.sequence_number(), 1000);
    });
}

/// Run the driver-level contract checks against a raw [`KeyValueDriver`].
///
/// Complements [`check_standard_suite`], which exercises a full store;
/// this suite pins the four callbacks' own semantics so a driver author
/// can test without composing an engine.
pub fn check_driver_contract<D: crate::KeyValueDriver>(driver: &D) {
    use crate::KeyedEvent;
    use serde_json::json;

    let key = unique_key("driver");
    let other = unique_key("driver");

    let record = |key: &str, sequence: i64, n: i64| KeyedEvent {
        key: key.to_string(),
        sequence,
        event_type: EventType::of::<IncrementEvent>(),
        data: json!({"increment_by": n}),
    };

    // Nothing exists before the first put.
    assert!(
        !driver
            .check_sequence(&key, 1)
            .expect("check_sequence should succeed"),
        "no sequence may exist before the first put"
    );
    assert!(
        driver
            .fetch_events(&key, 0)
            .expect("fetch_events should succeed")
            .is_empty(),
        "an unwritten stream must fetch empty"
    );

    // Contiguous puts become visible, ascending, with their payloads.
    driver
        .put_events(vec![record(&key, 1, 10), record(&key, 2, 20)])
        .expect("the first batch should succeed");
    driver
        .put_events(vec![record(&key, 3, 30)])
        .expect("the second batch should succeed");

    let fetched = driver
        .fetch_events(&key, 1)
        .expect("fetch_events should succeed");
    assert_eq!(
        fetched.iter().map(|event| event.sequence).collect::<Vec<_>>(),
        vec![2, 3],
        "fetch returns events strictly after the given sequence, ascending"
    );
    assert_eq!(fetched[0].data["increment_by"], json!(20));

    assert!(driver.check_sequence(&key, 3).expect("check should succeed"));
    assert!(!driver.check_sequence(&key, 4).expect("check should succeed"));

    // Uniqueness: overwriting an occupied sequence is a concurrency fault
    // naming the first offender, and the batch takes no partial effect.
    let fault = driver
        .put_events(vec![record(&other, 1, 1), record(&key, 3, 99)])
        .expect_err("overwriting sequence 3 must fail");
    assert_eq!(
        fault.as_concurrency(),
        Some((key.as_str(), 3)),
        "the fault names the first offending (key, sequence)"
    );
    assert!(
        driver
            .fetch_events(&other, 0)
            .expect("fetch_events should succeed")
            .is_empty(),
        "a rejected batch must write nothing"
    );

    // Streams are independent per key.
    driver
        .put_events(vec![record(&other, 1, 1)])
        .expect("an independent stream should accept its first event");
    assert_eq!(
        driver
            .fetch_events(&key, 0)
            .expect("fetch_events should succeed")
            .len(),
        3
    );
}

/// Writer double claiming a committed history that does not exist.
struct FakeStoreWriter {
    key: String,
    registry: Arc<EventRegistry>,
    origin: i64,
    events: Vec<Event>,
}

impl Adapter for FakeStoreWriter {
    fn key(&self) -> &str {
        &self.key
    }
}

impl PositionalAdapter for FakeStoreWriter {
    fn sequence_number(&self) -> i64 {
        self.origin + self.events.len() as i64
    }
}

impl EventAdapter for FakeStoreWriter {
    fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    fn is_dirty(&self) -> bool {
        !self.events.is_empty()
    }
}

impl StoreWriter for FakeStoreWriter {
    fn uncommitted(&self) -> (i64, &[Event]) {
        (self.origin, &self.events)
    }

    fn state(&self) -> Result<Value, Fault> {
        Ok(Value::Object(serde_json::Map::new()))
    }
}
