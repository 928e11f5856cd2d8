//! Event-sourced aggregates over ordered per-key streams.
//!
//! `keyfold` provides the building blocks for applications whose
//! authoritative state is a totally ordered sequence of immutable domain
//! events per key: an aggregate runtime with explicit command/replay
//! wiring, an event store contract with optimistic single-writer
//! concurrency, and a middleware chain for snapshotting, logging, and
//! post-commit publication.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`AggregateState`] | Domain model: wires command handlers and replay routes |
//! | [`AggregateRoot`] | Runtime for one aggregate: refresh/handle/commit cycle |
//! | [`EventRegistry`] | Domain-scoped label → event shape mapping |
//! | [`EventStore`] | Uniform storage contract over per-key event streams |
//! | [`KeyValueStore`] | Store engine over a four-operation backend driver |
//! | [`MiddlewareStore`] | Commit/refresh interception chain around a base store |
//! | [`EventRouter`] | Consumer-side dispatch for published events |
//!
//! # Quick Start
//!
//! ```
//! use keyfold::{AggregateRoot, AggregateState, Dispatch, Event, EventRegistry, Fault};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! // 1. Define the aggregate's state, events, and commands.
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! #[serde(default)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Incremented {
//!     by: i64,
//! }
//!
//! struct Increment {
//!     by: i64,
//! }
//!
//! // 2. Wire replay routes and command handlers.
//! impl AggregateState for Counter {
//!     fn wire(dispatch: &mut Dispatch<Self>) {
//!         dispatch.on_event::<Incremented>(|state, event| state.count += event.by);
//!         dispatch.on_command::<Increment>(|_state, _key, command| {
//!             Ok(vec![Event::of(Incremented { by: command.by })])
//!         });
//!     }
//! }
//!
//! # fn main() -> Result<(), Fault> {
//! // 3. Register the events and run commands against a store.
//! let mut registry = EventRegistry::new("Counting");
//! registry.register::<Incremented>().expect("no label collisions");
//!
//! let store = Arc::new(keyfold::memory_store());
//! let mut counter: AggregateRoot<Counter> =
//!     AggregateRoot::initialize("c-1", Arc::new(registry), store);
//!
//! counter.handle(Increment { by: 2 })?;
//! assert_eq!(counter.state().count, 2);
//! assert_eq!(counter.sequence_number(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Concurrent writers for one key race optimistically: the loser gets a
//! [`Fault::Concurrency`] and re-runs its command via [`retry`]. Concrete
//! backends implement the four [`KeyValueDriver`] operations; ordering,
//! uniqueness, label checks, and payload decode all live in the engine.

mod adapter;
mod aggregate;
mod decode;
mod event;
mod fault;
mod handler;
mod memory;
mod middleware;
mod registry;
mod store;

pub mod inproc;
pub mod logging;
pub mod publish;
pub mod snapshot;
pub mod tailer;
pub mod testkit;

pub use adapter::{Adapter, EventAdapter, PositionalAdapter, StoreLoader, StoreWriter};
pub use aggregate::{AggregateRoot, AggregateState, Dispatch};
pub use decode::from_value_weak;
pub use event::{Event, PublishedEvent};
pub use fault::{Fault, retry};
pub use handler::{EventConsumer, EventHandler, EventRouter};
pub use memory::{MemoryDriver, memory_store};
pub use middleware::{
    Cleanup, CommitMiddleware, CommitNext, MiddlewareStore, RefreshMiddleware, RefreshNext,
};
pub use publish::EventPublisher;
pub use registry::{CommandRegistry, CommandType, DuplicateLabel, EventRegistry, EventType};
pub use store::{EventStore, KeyValueDriver, KeyValueStore, KeyedEvent};
