//! Single-process event distribution.
//!
//! An [`InProcessDistributor`] is a publisher and consumer in one: events
//! published into it are fanned out synchronously to every attached
//! handler, in registration order. Useful for modular monoliths and
//! tests, where commit and consumption happen in the same process.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::event::{Event, PublishedEvent};
use crate::fault::Fault;
use crate::handler::{EventConsumer, EventHandler};
use crate::publish::EventPublisher;
use crate::registry::EventRegistry;

/// In-process publisher/consumer pair.
///
/// Publication is gated by [`start`](EventConsumer::start) and
/// [`stop`](EventConsumer::stop): outside that window `publish` is a
/// no-op. The first handler fault aborts the fan-out and surfaces to the
/// publisher.
///
/// # Examples
///
/// Wired between the publish middleware and an [`EventRouter`], the
/// distributor feeds read models synchronously with each commit:
///
/// ```
/// use keyfold::inproc::InProcessDistributor;
/// use keyfold::{memory_store, publish, EventConsumer, MiddlewareStore};
/// use keyfold::testkit::test_registry;
/// use std::sync::Arc;
///
/// let distributor = Arc::new(InProcessDistributor::new(test_registry()));
/// distributor.start().expect("start should succeed");
///
/// let mut store = MiddlewareStore::new(Arc::new(memory_store()));
/// let (commit, refresh, cleanup) = publish::middleware(distributor.clone());
/// store.use_middleware(commit, refresh, cleanup);
/// ```
///
/// [`EventRouter`]: crate::EventRouter
pub struct InProcessDistributor {
    enabled: AtomicBool,
    handlers: Mutex<Vec<Box<dyn EventHandler>>>,
    registry: Arc<EventRegistry>,
}

impl InProcessDistributor {
    /// Create a distributor resolving events through `registry`.
    pub fn new(registry: Arc<EventRegistry>) -> InProcessDistributor {
        InProcessDistributor {
            enabled: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            registry,
        }
    }
}

impl EventConsumer for InProcessDistributor {
    fn start(&self) -> Result<(), Fault> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), Fault> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn add_handler(&self, handler: Box<dyn EventHandler>) {
        self.handlers
            .lock()
            .expect("distributor mutex poisoned")
            .push(handler);
    }
}

impl EventPublisher for InProcessDistributor {
    fn publish(&self, key: &str, sequence: i64, event: &Event) -> Result<(), Fault> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut handlers = self.handlers.lock().expect("distributor mutex poisoned");
        if handlers.is_empty() {
            return Ok(());
        }

        let (label, found) = self.registry.type_of(event);
        if !found {
            return Err(Fault::UnknownEvent { label });
        }

        let published = PublishedEvent {
            domain: self.registry.domain().to_string(),
            event_type: label,
            key: key.to_string(),
            sequence,
            data: self.registry.encode(event)?,
        };

        for handler in handlers.iter_mut() {
            handler.handle(&published)?;
        }
        Ok(())
    }
}
