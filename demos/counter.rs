//! Self-contained example demonstrating aggregates, snapshot and publish
//! middleware, and in-process event distribution.
//!
//! Run with: `cargo run --example counter`

use std::sync::{Arc, Mutex};

use keyfold::inproc::InProcessDistributor;
use keyfold::snapshot::{self, MemorySnapshots, SnapshotParams};
use keyfold::{
    AggregateRoot, AggregateState, Dispatch, Event, EventConsumer, EventHandler, EventRegistry,
    EventRouter, EventStore, Fault, MiddlewareStore, PublishedEvent, memory_store, publish, retry,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Counter aggregate
// ---------------------------------------------------------------------------

/// A simple counter that can be incremented, decremented, or reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Counter {
    value: i64,
}

/// Request to move the counter up.
struct Increment;

/// Request to move the counter down.
struct Decrement;

/// Request to reset the counter to zero.
struct Reset;

/// The counter moved up by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented {}

/// The counter moved down by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Decremented {}

/// The counter was reset; remembers what it held before.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct WasReset {
    previous: i64,
}

impl AggregateState for Counter {
    fn wire(dispatch: &mut Dispatch<Self>) {
        dispatch.on_event::<Incremented>(|state, _event| state.value += 1);
        dispatch.on_event::<Decremented>(|state, _event| state.value -= 1);
        dispatch.on_event::<WasReset>(|state, _event| state.value = 0);

        dispatch.on_command::<Increment>(|_state, _key, _command| {
            Ok(vec![Event::of(Incremented {})])
        });
        dispatch.on_command::<Decrement>(|state, key, _command| {
            if state.value <= 0 {
                return Err(Fault::domain(key, "already_zero"));
            }
            Ok(vec![Event::of(Decremented {})])
        });
        dispatch.on_command::<Reset>(|state, key, _command| {
            if state.value == 0 {
                return Err(Fault::domain(key, "nothing_to_reset"));
            }
            Ok(vec![Event::of(WasReset {
                previous: state.value,
            })])
        });
    }
}

fn counter_registry() -> Arc<EventRegistry> {
    let mut registry = EventRegistry::new("Counters");
    registry.register::<Incremented>().expect("no collisions");
    registry.register::<Decremented>().expect("no collisions");
    registry.register::<WasReset>().expect("no collisions");
    Arc::new(registry)
}

// ---------------------------------------------------------------------------
// Activity feed (read model fed by the distributor)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Activity {
    lines: Vec<String>,
}

fn activity_router(registry: Arc<EventRegistry>) -> EventRouter<Activity> {
    let mut router = EventRouter::new(registry, Activity::default());
    router.on::<Incremented>(|activity, key, sequence, _event| {
        activity.lines.push(format!("{key}#{sequence}: incremented"));
        Ok(())
    });
    router.on::<WasReset>(|activity, key, sequence, event| {
        activity
            .lines
            .push(format!("{key}#{sequence}: reset from {}", event.previous));
        Ok(())
    });
    router
}

/// Bridges the router into the distributor and mirrors its lines out.
struct FeedHandler {
    router: EventRouter<Activity>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl EventHandler for FeedHandler {
    fn handle(&mut self, event: &PublishedEvent) -> Result<(), Fault> {
        self.router.handle(event)?;
        *self.lines.lock().unwrap() = self.router.state().lines.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn main() -> Result<(), Fault> {
    let registry = counter_registry();

    // Distributor: committed events fan out to the activity feed.
    let distributor = Arc::new(InProcessDistributor::new(registry.clone()));
    let lines = Arc::new(Mutex::new(Vec::new()));
    distributor.add_handler(Box::new(FeedHandler {
        router: activity_router(registry.clone()),
        lines: lines.clone(),
    }));
    distributor.start()?;

    // Store stack: snapshots every 5 events, then publication.
    let mut wrapper = MiddlewareStore::new(Arc::new(memory_store()));
    let (commit, refresh, cleanup) = snapshot::middleware(
        Arc::new(MemorySnapshots::new()),
        SnapshotParams {
            interval: 5,
            lazy: false,
        },
    );
    wrapper.use_middleware(commit, refresh, cleanup);
    let (commit, refresh, cleanup) = publish::middleware(distributor.clone());
    wrapper.use_middleware(commit, refresh, cleanup);
    let store: Arc<dyn EventStore> = Arc::new(wrapper);

    // Drive the counter the way a request handler would: a fresh
    // aggregate per request, retried on write conflicts.
    for _ in 0..7 {
        retry(10, || {
            let mut counter: AggregateRoot<Counter> =
                AggregateRoot::initialize("demo", registry.clone(), store.clone());
            counter.handle(Increment)
        })?;
    }

    retry(10, || {
        let mut counter: AggregateRoot<Counter> =
            AggregateRoot::initialize("demo", registry.clone(), store.clone());
        counter.handle(Reset)
    })?;

    // Rebuild from storage and show what happened.
    let mut replayed: AggregateRoot<Counter> =
        AggregateRoot::initialize("demo", registry.clone(), store.clone());
    replayed.refresh()?;
    println!(
        "counter value after replaying {} events: {}",
        replayed.sequence_number(),
        replayed.state().value
    );

    for line in lines.lock().unwrap().iter() {
        println!("activity: {line}");
    }

    distributor.stop()?;
    store.close()?;
    Ok(())
}
