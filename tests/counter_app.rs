//! A small counter application driven end to end: a capped counter
//! aggregate behind a stacked store (interval snapshots, a lazy
//! in-memory snapshot cache, logging), with contended increments retried
//! the way a request handler would.

use std::sync::Arc;

use keyfold::snapshot::{self, MemorySnapshots, SnapshotParams};
use keyfold::{
    AggregateRoot, AggregateState, Dispatch, Event, EventRegistry, EventStore, Fault,
    MiddlewareStore, logging, memory_store, retry,
};
use serde::{Deserialize, Serialize};

/// Counts the number of times it has been incremented, up to a cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TallyCounter {
    count: i64,
}

const COUNTER_LIMIT: i64 = 30;

/// Moves the counter up by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented {}

/// Request to move the counter up.
struct Increment {}

impl AggregateState for TallyCounter {
    fn wire(dispatch: &mut Dispatch<Self>) {
        dispatch.on_event::<Incremented>(|state, _event| state.count += 1);

        dispatch.on_command::<Increment>(|state, key, _command| {
            if state.count >= COUNTER_LIMIT {
                return Err(Fault::domain(key, "limit_reached"));
            }
            Ok(vec![Event::of(Incremented {})])
        });
    }
}

fn counter_registry() -> Arc<EventRegistry> {
    let mut registry = EventRegistry::new("Counters");
    registry
        .register::<Incremented>()
        .expect("registration should succeed");
    Arc::new(registry)
}

/// The store stack the application composes at startup: durable interval
/// snapshots closest to the store, a lazy per-commit cache above it, and
/// logging around everything.
fn app_store() -> Arc<dyn EventStore> {
    let mut wrapper = MiddlewareStore::new(Arc::new(memory_store()));

    let (commit, refresh, cleanup) = snapshot::middleware(
        Arc::new(MemorySnapshots::new()),
        SnapshotParams {
            interval: 10,
            lazy: false,
        },
    );
    wrapper.use_middleware(commit, refresh, cleanup);

    let (commit, refresh, cleanup) = snapshot::middleware(
        Arc::new(MemorySnapshots::new()),
        SnapshotParams {
            interval: 1,
            lazy: true,
        },
    );
    wrapper.use_middleware(commit, refresh, cleanup);

    let (commit, refresh, cleanup) = logging::middleware();
    wrapper.use_middleware(commit, refresh, cleanup);

    Arc::new(wrapper)
}

/// What a request handler does for `GET /:name/increment`: retry the
/// whole refresh/handle/commit cycle against a fresh aggregate until the
/// optimistic write lands.
fn increment(store: &Arc<dyn EventStore>, name: &str) -> Result<i64, Fault> {
    let mut observed = 0;
    retry(100, || {
        let mut aggregate: AggregateRoot<TallyCounter> =
            AggregateRoot::initialize(name, counter_registry(), store.clone());
        aggregate.handle(Increment {})?;
        observed = aggregate.state().count;
        Ok(())
    })?;
    Ok(observed)
}

#[test]
fn increments_count_up_to_the_limit() {
    let store: Arc<dyn EventStore> = Arc::new(memory_store());
    let mut aggregate: AggregateRoot<TallyCounter> =
        AggregateRoot::initialize("dummy-key", counter_registry(), store);

    for _ in 0..30 {
        aggregate
            .handle(Increment {})
            .expect("increments under the limit should succeed");
    }
    assert_eq!(aggregate.state().count, 30);

    let fault = aggregate
        .handle(Increment {})
        .expect_err("the 31st increment must be rejected");
    assert_eq!(
        fault.as_domain(),
        Some(("dummy-key", "limit_reached")),
        "the cap surfaces as a domain fault"
    );
}

#[test]
fn request_loop_counts_through_the_full_stack() {
    let store = app_store();

    for expected in 1..=25 {
        let count = increment(&store, "visits").expect("increment should succeed");
        assert_eq!(count, expected);
    }

    let mut reader: AggregateRoot<TallyCounter> =
        AggregateRoot::initialize("visits", counter_registry(), store.clone());
    reader.refresh().expect("refresh should succeed");
    assert_eq!(reader.state().count, 25);
    assert_eq!(reader.sequence_number(), 25);

    store.close().expect("close should succeed");
}

#[test]
fn limit_faults_pass_through_the_retry_helper_unretried() {
    let store = app_store();

    for _ in 0..COUNTER_LIMIT {
        increment(&store, "capped").expect("increments under the limit succeed");
    }

    let fault = increment(&store, "capped").expect_err("the cap must hold");
    assert_eq!(fault.as_domain().map(|(_, code)| code), Some("limit_reached"));

    // The rejected request must not have written anything.
    let mut reader: AggregateRoot<TallyCounter> =
        AggregateRoot::initialize("capped", counter_registry(), store);
    reader.refresh().expect("refresh should succeed");
    assert_eq!(reader.sequence_number(), COUNTER_LIMIT);
}

#[test]
fn contended_counters_converge_through_retry() {
    let store = app_store();

    // Interleave two request loops against one counter; every request
    // retries its way past the other's commits.
    for _ in 0..10 {
        increment(&store, "shared").expect("first loop increment succeeds");
        increment(&store, "shared").expect("second loop increment succeeds");
    }

    let mut reader: AggregateRoot<TallyCounter> =
        AggregateRoot::initialize("shared", counter_registry(), store);
    reader.refresh().expect("refresh should succeed");
    assert_eq!(reader.state().count, 20);
}

#[test]
fn counters_are_independent_per_key() {
    let store = app_store();

    increment(&store, "alpha").expect("increment should succeed");
    increment(&store, "alpha").expect("increment should succeed");
    increment(&store, "beta").expect("increment should succeed");

    let mut alpha: AggregateRoot<TallyCounter> =
        AggregateRoot::initialize("alpha", counter_registry(), store.clone());
    alpha.refresh().expect("refresh should succeed");
    let mut beta: AggregateRoot<TallyCounter> =
        AggregateRoot::initialize("beta", counter_registry(), store);
    beta.refresh().expect("refresh should succeed");

    assert_eq!(alpha.state().count, 2);
    assert_eq!(beta.state().count, 1);
}
