//! Consumer-side dispatch for published events.
//!
//! An [`EventRouter`] mirrors the aggregate's dispatch tables for the
//! receiving end of a distribution boundary: routes are registered per
//! event type, and incoming [`PublishedEvent`] records are decoded through
//! the registry before the route runs. Events without a route are a
//! successful no-op, so a consumer only declares the subset it cares
//! about.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de;

use crate::event::PublishedEvent;
use crate::fault::Fault;
use crate::registry::{EventRegistry, EventType};

/// A consumer of events delivered from a publishing source.
pub trait EventHandler: Send {
    /// Handle one published event and apply any consequences.
    fn handle(&mut self, event: &PublishedEvent) -> Result<(), Fault>;
}

/// A consuming endpoint multiplexing one stream to many handlers.
pub trait EventConsumer {
    /// Start delivering events to the attached handlers.
    fn start(&self) -> Result<(), Fault>;

    /// Stop delivering events.
    fn stop(&self) -> Result<(), Fault>;

    /// Attach a handler. Handlers run in registration order.
    fn add_handler(&self, handler: Box<dyn EventHandler>);
}

type Route<S> = Box<dyn Fn(&mut S, &str, i64, &dyn Any) -> Result<(), Fault> + Send>;

/// Label-keyed dispatch from published events into consumer state.
///
/// The router owns its state `S`; routes receive it mutably together with
/// the event's key, sequence, and decoded payload.
///
/// # Examples
///
/// ```
/// use keyfold::{EventHandler, EventRegistry, EventRouter, PublishedEvent};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Credited {
///     amount: i64,
/// }
///
/// let mut registry = EventRegistry::new("Ledger");
/// registry.register::<Credited>().expect("no collisions");
///
/// let mut router = EventRouter::new(Arc::new(registry), 0i64);
/// router.on::<Credited>(|balance, _key, _sequence, event| {
///     *balance += event.amount;
///     Ok(())
/// });
///
/// router
///     .handle(&PublishedEvent {
///         domain: "Ledger".into(),
///         event_type: "Credited".into(),
///         key: "acct-1".into(),
///         sequence: 1,
///         data: json!({"amount": 25}),
///     })
///     .expect("handle should succeed");
/// assert_eq!(*router.state(), 25);
/// ```
pub struct EventRouter<S> {
    registry: Arc<EventRegistry>,
    routes: HashMap<EventType, Route<S>>,
    state: S,
}

impl<S: Send> EventRouter<S> {
    /// Create a router over `state` decoding through `registry`.
    pub fn new(registry: Arc<EventRegistry>, state: S) -> EventRouter<S> {
        EventRouter {
            registry,
            routes: HashMap::new(),
            state,
        }
    }

    /// Register a route for event type `E`, keyed by its simple name.
    pub fn on<E: Any + Send + Sync>(
        &mut self,
        route: impl Fn(&mut S, &str, i64, &E) -> Result<(), Fault> + Send + 'static,
    ) {
        self.routes.insert(
            EventType::of::<E>(),
            Box::new(move |state, key, sequence, any| {
                let event = any
                    .downcast_ref::<E>()
                    .ok_or_else(|| {
                        Fault::Decode(de::Error::custom(
                            "published payload did not decode to the routed type",
                        ))
                    })?;
                route(state, key, sequence, event)
            }),
        );
    }

    /// The router's state.
    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S: Send> EventHandler for EventRouter<S> {
    /// Route one published event.
    ///
    /// Events without a registered route succeed as a no-op. Routed events
    /// decode their payload through the registry (weakly typed, RFC 3339
    /// date-times) before the route runs.
    fn handle(&mut self, event: &PublishedEvent) -> Result<(), Fault> {
        let Some(route) = self.routes.get(&event.event_type) else {
            return Ok(());
        };

        let decoded = self
            .registry
            .decode(&event.event_type, event.data.clone())?;
        let payload = decoded.typed_payload().ok_or_else(|| {
            Fault::UnknownEvent {
                label: event.event_type.clone(),
            }
        })?;

        route(&mut self.state, &event.key, event.sequence, payload)
    }
}
