//! Aggregate runtime: dispatch tables, event application, and the
//! refresh/handle/commit cycle.
//!
//! An aggregate is a state type implementing [`AggregateState`] plus an
//! [`AggregateRoot`] that owns the key, the sequence counters, the
//! uncommitted buffer, and the dispatch tables. Command handlers and
//! replay routes are wired explicitly through [`Dispatch`]; the root
//! invokes `wire` once at initialization.
//!
//! A single root instance is owned by one thread at a time; concurrency
//! across instances of the same key is resolved optimistically by the
//! store.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::adapter::{Adapter, EventAdapter, PositionalAdapter, StoreLoader, StoreWriter};
use crate::decode::from_value_weak;
use crate::event::Event;
use crate::fault::Fault;
use crate::registry::{EventRegistry, EventType, simple_name};
use crate::store::EventStore;

/// State derived from an aggregate's event history.
///
/// The implementing type is the aggregate's state. `wire` declares the
/// aggregate's replay routes and command handlers; it runs once when an
/// [`AggregateRoot`] is initialized.
///
/// # Contract
///
/// - Command handlers must be pure decision functions: no I/O, no side
///   effects. They validate a command against current state and return
///   zero or more events, or a fault.
/// - Replay routes must be total. Events without a route (or absent from
///   the registry) are ignored; only the sequence number advances.
pub trait AggregateState: Default + Serialize + DeserializeOwned + Send + 'static {
    /// Register this aggregate's replay routes and command handlers.
    fn wire(dispatch: &mut Dispatch<Self>);
}

type ReplayRoute<S> = Box<dyn Fn(&mut S, &Event) + Send>;
type CommandRoute<S> = Box<dyn Fn(&S, &str, &dyn Any) -> Result<Vec<Event>, Fault> + Send>;

/// Dispatch tables mapping event labels to replay routes and command types
/// to handlers.
pub struct Dispatch<S> {
    replay: HashMap<EventType, ReplayRoute<S>>,
    commands: HashMap<TypeId, CommandRoute<S>>,
}

impl<S> Dispatch<S> {
    fn new() -> Dispatch<S> {
        Dispatch {
            replay: HashMap::new(),
            commands: HashMap::new(),
        }
    }

    /// Register a replay route for event type `E`.
    ///
    /// The route is keyed by `E`'s simple type name. A payload that is not
    /// actually an `E` (a raw event under the same label) is skipped;
    /// event application is fail-safe.
    pub fn on_event<E: Any + Send + Sync>(
        &mut self,
        replay: impl Fn(&mut S, &E) + Send + 'static,
    ) {
        self.replay.insert(
            EventType::of::<E>(),
            Box::new(move |state, event| {
                if let Some(typed) = event.downcast_ref::<E>() {
                    replay(state, typed);
                }
            }),
        );
    }

    /// Register a command handler for command type `C`.
    ///
    /// The handler receives the current state, the aggregate key, and the
    /// command, and returns the events the command produces.
    pub fn on_command<C: Any>(
        &mut self,
        handler: impl Fn(&S, &str, &C) -> Result<Vec<Event>, Fault> + Send + 'static,
    ) {
        self.commands.insert(
            TypeId::of::<C>(),
            Box::new(move |state, key, any| {
                let command = any
                    .downcast_ref::<C>()
                    .expect("command dispatch is keyed by TypeId");
                handler(state, key, command)
            }),
        );
    }
}

/// The runtime for one aggregate instance.
///
/// Holds the derived state, the sequence counters, and the buffer of
/// events applied since the last commit. Not safe for concurrent use; one
/// thread owns an instance at a time.
pub struct AggregateRoot<S: AggregateState> {
    key: String,
    sequence: i64,
    committed: i64,
    registry: Arc<EventRegistry>,
    store: Arc<dyn EventStore>,
    dispatch: Dispatch<S>,
    state: S,
    uncommitted: Vec<Event>,
}

impl<S: AggregateState> AggregateRoot<S> {
    /// Create an aggregate instance bound to a key, registry, and store.
    ///
    /// The instance starts empty at sequence 0; call [`refresh`] (or use
    /// [`handle`]/[`run`], which refresh first) to load its history.
    ///
    /// [`refresh`]: AggregateRoot::refresh
    /// [`handle`]: AggregateRoot::handle
    /// [`run`]: AggregateRoot::run
    pub fn initialize(
        key: impl Into<String>,
        registry: Arc<EventRegistry>,
        store: Arc<dyn EventStore>,
    ) -> AggregateRoot<S> {
        let mut dispatch = Dispatch::new();
        S::wire(&mut dispatch);

        AggregateRoot {
            key: key.into(),
            sequence: 0,
            committed: 0,
            registry,
            store,
            dispatch,
            state: S::default(),
            uncommitted: Vec::new(),
        }
    }

    /// The aggregate's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current sequence number: the count of events applied in-memory.
    pub fn sequence_number(&self) -> i64 {
        self.sequence
    }

    /// Sequence number up to which events are durably committed.
    pub fn committed_sequence(&self) -> i64 {
        self.committed
    }

    /// True when events are buffered but not yet committed.
    pub fn is_dirty(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// The current derived state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Process a command: refresh, dispatch to its handler, commit.
    ///
    /// Equivalent to `run(|aggregate| ...dispatch...)`. Handler faults
    /// propagate without buffering any events; store faults propagate
    /// unchanged.
    ///
    /// # Errors
    ///
    /// [`Fault::UnsupportedCommand`] when no handler is registered for
    /// `C`; otherwise whatever the handler or store returns.
    pub fn handle<C: Any>(&mut self, command: C) -> Result<(), Fault> {
        self.run(move |aggregate| aggregate.handle_internal(command))
    }

    /// Run a refresh/mutate/commit cycle around `action`.
    ///
    /// Each step's fault propagates immediately; a failed action leaves
    /// the aggregate dirty and uncommitted.
    pub fn run(
        &mut self,
        action: impl FnOnce(&mut Self) -> Result<(), Fault>,
    ) -> Result<(), Fault> {
        self.refresh()?;
        action(self)?;
        self.commit()
    }

    fn handle_internal<C: Any>(&mut self, command: C) -> Result<(), Fault> {
        let events = {
            let route = self.dispatch.commands.get(&TypeId::of::<C>()).ok_or_else(|| {
                Fault::UnsupportedCommand {
                    command: simple_name(std::any::type_name::<C>()).to_string(),
                }
            })?;
            route(&self.state, &self.key, &command)?
        };

        for event in events {
            self.apply_event(event);
        }
        Ok(())
    }

    /// Apply a concrete event value to the aggregate.
    ///
    /// Shorthand for `apply_event(Event::of(event))`.
    pub fn apply<E: Any + Send + Sync>(&mut self, event: E) {
        self.apply_event(Event::of(event));
    }

    /// Apply an event: mutate state through its replay route, advance the
    /// sequence, and buffer the event for the next commit.
    ///
    /// Events that are unknown to the registry, or known but without a
    /// replay route, advance the sequence only. This tolerates historical
    /// events whose replay is no longer defined.
    pub fn apply_event(&mut self, event: Event) {
        self.apply_internal(&event);
        self.uncommitted.push(event);
    }

    fn apply_internal(&mut self, event: &Event) {
        let (label, found) = self.registry.type_of(event);
        if found {
            if let Some(route) = self.dispatch.replay.get(&label) {
                route(&mut self.state, event);
            }
        }
        self.sequence += 1;
    }

    /// Register a replay route under an explicit label.
    ///
    /// Unlike [`Dispatch::on_event`] the route receives the untyped
    /// [`Event`]; use this for label-keyed, late-bound replay definitions.
    pub fn define_replay(
        &mut self,
        label: EventType,
        replay: impl Fn(&mut S, &Event) + Send + 'static,
    ) {
        self.dispatch.replay.insert(label, Box::new(replay));
    }

    /// Reload the aggregate from the store.
    ///
    /// # Errors
    ///
    /// [`Fault::DirtyAggregate`] when uncommitted events are buffered;
    /// otherwise whatever the store returns.
    pub fn refresh(&mut self) -> Result<(), Fault> {
        let store = Arc::clone(&self.store);
        store.refresh(&mut RootLoader { root: self })
    }

    /// Persist the buffered events through the store.
    ///
    /// On success the buffer is cleared and the committed sequence catches
    /// up to the current one. On failure the buffer is left intact and the
    /// fault surfaces unchanged.
    pub fn commit(&mut self) -> Result<(), Fault> {
        let store = Arc::clone(&self.store);
        store.commit_events(&RootWriter { root: self })?;

        self.uncommitted.clear();
        self.committed = self.sequence;
        Ok(())
    }
}

/// Loader adapter handing refresh mutations back to the root.
struct RootLoader<'a, S: AggregateState> {
    root: &'a mut AggregateRoot<S>,
}

impl<S: AggregateState> Adapter for RootLoader<'_, S> {
    fn key(&self) -> &str {
        &self.root.key
    }
}

impl<S: AggregateState> PositionalAdapter for RootLoader<'_, S> {
    fn sequence_number(&self) -> i64 {
        self.root.sequence
    }
}

impl<S: AggregateState> EventAdapter for RootLoader<'_, S> {
    fn registry(&self) -> &EventRegistry {
        &self.root.registry
    }

    fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }
}

impl<S: AggregateState> StoreLoader for RootLoader<'_, S> {
    fn replay_event(&mut self, event: Event) {
        self.root.apply_internal(&event);
        self.root.committed += 1;
    }

    fn restore_snapshot(&mut self, sequence: i64, state: &Value) -> Result<(), Fault> {
        let decoded = from_value_weak::<S>(state.clone())?;
        self.root.state = decoded;
        self.root.sequence = sequence;
        self.root.committed = sequence;
        Ok(())
    }
}

/// Writer adapter exposing the root's pending commit to the store.
struct RootWriter<'a, S: AggregateState> {
    root: &'a AggregateRoot<S>,
}

impl<S: AggregateState> Adapter for RootWriter<'_, S> {
    fn key(&self) -> &str {
        &self.root.key
    }
}

impl<S: AggregateState> PositionalAdapter for RootWriter<'_, S> {
    fn sequence_number(&self) -> i64 {
        self.root.sequence
    }
}

impl<S: AggregateState> EventAdapter for RootWriter<'_, S> {
    fn registry(&self) -> &EventRegistry {
        &self.root.registry
    }

    fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }
}

impl<S: AggregateState> StoreWriter for RootWriter<'_, S> {
    fn uncommitted(&self) -> (i64, &[Event]) {
        (self.root.committed, &self.root.uncommitted)
    }

    fn state(&self) -> Result<Value, Fault> {
        Ok(serde_json::to_value(&self.root.state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{
        ErrorStore, IncrementCounter, InitializeCounter, InitializeEvent,
        NullStore, SimpleCounter, UnmappedEvent, test_registry,
    };

    fn counter(store: Arc<dyn EventStore>) -> AggregateRoot<SimpleCounter> {
        AggregateRoot::initialize("dummy-key", test_registry(), store)
    }

    #[test]
    fn event_application_mutates_state() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate.refresh().expect("refresh should succeed");

        assert_eq!(aggregate.sequence_number(), 0);
        assert_eq!(aggregate.state().target_value, 0);

        aggregate.apply(InitializeEvent { target_value: 3 });

        assert_eq!(aggregate.sequence_number(), 1);
        assert_eq!(aggregate.state().target_value, 3);
    }

    #[test]
    fn run_refreshes_executes_and_commits() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate
            .run(|aggregate| {
                aggregate.apply(InitializeEvent { target_value: 3 });
                Ok(())
            })
            .expect("run should succeed");

        assert_eq!(aggregate.sequence_number(), 1);
        assert_eq!(aggregate.state().target_value, 3);
        assert!(!aggregate.is_dirty(), "run commits at the end");
    }

    #[test]
    fn commit_clears_the_dirty_flag() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate.refresh().expect("refresh should succeed");
        assert!(!aggregate.is_dirty());

        aggregate.apply(InitializeEvent { target_value: 3 });
        assert!(aggregate.is_dirty());

        aggregate.commit().expect("commit should succeed");
        assert!(!aggregate.is_dirty());
        assert_eq!(aggregate.committed_sequence(), 1);
    }

    #[test]
    fn unmapped_events_advance_the_sequence_only() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate.refresh().expect("refresh should succeed");

        aggregate.apply(UnmappedEvent {});

        assert_eq!(aggregate.sequence_number(), 1);
        assert_eq!(aggregate.state().target_value, 0);
        assert_eq!(aggregate.state().current_count, 0);
    }

    #[test]
    fn define_replay_wires_a_label_keyed_route() {
        // Register the otherwise-unmapped event so the registry knows it,
        // then wire a replay route for it at runtime.
        let mut registry = EventRegistry::new("Testing");
        registry.register::<InitializeEvent>().unwrap();
        registry.register::<UnmappedEvent>().unwrap();

        let mut aggregate: AggregateRoot<SimpleCounter> =
            AggregateRoot::initialize("dummy-key", Arc::new(registry), Arc::new(NullStore));

        // Known to the registry but not yet mapped: sequence bumps only.
        aggregate.apply(UnmappedEvent {});
        assert_eq!(aggregate.sequence_number(), 1);
        assert_eq!(aggregate.state().target_value, 0);

        aggregate.define_replay(EventType::of::<UnmappedEvent>(), |state, _event| {
            state.target_value *= 2;
        });

        aggregate.apply(InitializeEvent { target_value: 3 });
        aggregate.apply(UnmappedEvent {});

        assert_eq!(aggregate.sequence_number(), 3);
        assert_eq!(aggregate.state().target_value, 6);
    }

    #[test]
    fn store_faults_propagate_unchanged() {
        let store = Arc::new(ErrorStore::new(|| Fault::backend(std::io::Error::other(
            "example error",
        ))));
        let mut aggregate = counter(store);

        let refresh_fault = aggregate.refresh().expect_err("refresh should fail");
        assert!(matches!(refresh_fault, Fault::Backend(_)));

        aggregate.apply(UnmappedEvent {});
        let commit_fault = aggregate.commit().expect_err("commit should fail");
        assert!(matches!(commit_fault, Fault::Backend(_)));
        assert!(aggregate.is_dirty(), "a failed commit keeps the buffer");
    }

    #[test]
    fn handle_dispatches_to_the_registered_handler() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate
            .handle(InitializeCounter { target_value: 5 })
            .expect("handle should succeed");

        assert_eq!(aggregate.state().target_value, 5);
        assert_eq!(aggregate.sequence_number(), 1);
        assert!(!aggregate.is_dirty(), "handle commits at the end");
    }

    #[test]
    fn handle_unregistered_command_is_unsupported() {
        struct StrayCommand;

        let mut aggregate = counter(Arc::new(NullStore));
        let fault = aggregate
            .handle(StrayCommand)
            .expect_err("unknown commands must fail");
        match fault {
            Fault::UnsupportedCommand { command } => assert_eq!(command, "StrayCommand"),
            other => panic!("expected UnsupportedCommand, got {other:?}"),
        }
    }

    #[test]
    fn handler_fault_propagates_without_buffering() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate
            .handle(InitializeCounter { target_value: 3 })
            .expect("first initialize should succeed");

        let fault = aggregate
            .handle(InitializeCounter { target_value: 9 })
            .expect_err("re-initializing must be rejected");
        assert_eq!(
            fault.as_domain(),
            Some(("dummy-key", "counter_already_initialized"))
        );
        assert!(!aggregate.is_dirty());
        assert_eq!(aggregate.state().target_value, 3);
    }

    #[test]
    fn handler_events_apply_in_order() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate
            .handle(InitializeCounter { target_value: 10 })
            .expect("initialize should succeed");
        aggregate
            .handle(IncrementCounter { increment_by: 2 })
            .expect("increment should succeed");
        aggregate
            .handle(IncrementCounter { increment_by: 3 })
            .expect("increment should succeed");

        assert_eq!(aggregate.state().current_count, 5);
        assert_eq!(aggregate.sequence_number(), 3);
    }

    #[test]
    fn commit_with_an_empty_buffer_succeeds() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate.refresh().expect("refresh should succeed");
        aggregate.commit().expect("an empty commit is a no-op");
        assert_eq!(aggregate.sequence_number(), 0);
        assert_eq!(aggregate.committed_sequence(), 0);
    }

    #[test]
    fn snapshot_restore_moves_both_sequence_counters() {
        let store = Arc::new(crate::testkit::TestStore::new());
        store.when_snapshot(
            "dummy-key",
            8,
            serde_json::json!({"current_count": 8, "target_value": 12}),
        );

        let mut aggregate = counter(store);
        aggregate.refresh().expect("refresh should succeed");

        assert_eq!(aggregate.sequence_number(), 8);
        assert_eq!(aggregate.committed_sequence(), 8);
        assert_eq!(aggregate.state().current_count, 8);
        assert_eq!(aggregate.state().target_value, 12);
    }

    #[test]
    fn failed_snapshot_restore_leaves_the_aggregate_untouched() {
        let store = Arc::new(crate::testkit::TestStore::new());
        store.when_snapshot(
            "dummy-key",
            8,
            serde_json::json!({"current_count": {"not": "a count"}}),
        );

        let mut aggregate = counter(store);
        let fault = aggregate.refresh().expect_err("the restore must fail");
        assert!(matches!(fault, Fault::Decode(_)));
        assert_eq!(aggregate.sequence_number(), 0);
        assert_eq!(aggregate.state().current_count, 0);
    }

    #[test]
    fn raw_events_under_a_known_label_are_skipped() {
        let mut aggregate = counter(Arc::new(NullStore));
        aggregate.apply_event(Event::raw(
            EventType::of::<InitializeEvent>(),
            serde_json::json!({"target_value": 3}),
        ));

        assert_eq!(aggregate.sequence_number(), 1);
        assert_eq!(
            aggregate.state().target_value,
            0,
            "raw payloads never reach replay routes"
        );
    }
}
