//! Middleware composition around a base event store.
//!
//! A [`MiddlewareStore`] wraps any [`EventStore`] and threads commit and
//! refresh calls through registered interceptors. Composition is LIFO
//! relative to registration: the last registered middleware runs
//! outermost, and the innermost `next` reaches the wrapped store.
//!
//! Middleware must be reentrant across concurrent aggregates of different
//! keys; serializing writes on a single key remains the store driver's
//! job.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::adapter::{StoreLoader, StoreWriter};
use crate::fault::Fault;
use crate::store::EventStore;

/// Continuation invoking the rest of the commit chain.
pub type CommitNext<'a> = &'a mut dyn FnMut(&dyn StoreWriter) -> Result<(), Fault>;

/// Continuation invoking the rest of the refresh chain.
pub type RefreshNext<'a> = &'a mut dyn FnMut(&mut dyn StoreLoader) -> Result<(), Fault>;

/// Interceptor around commit operations.
pub type CommitMiddleware =
    Box<dyn Fn(&dyn StoreWriter, CommitNext) -> Result<(), Fault> + Send + Sync>;

/// Interceptor around refresh operations.
pub type RefreshMiddleware =
    Box<dyn Fn(&mut dyn StoreLoader, RefreshNext) -> Result<(), Fault> + Send + Sync>;

/// Shutdown hook run when the wrapper closes.
pub type Cleanup = Box<dyn FnMut() -> Result<(), Fault> + Send>;

/// An event store with a commit/refresh interception chain.
///
/// # Examples
///
/// ```
/// use keyfold::{logging, memory_store, MiddlewareStore};
/// use std::sync::Arc;
///
/// let mut store = MiddlewareStore::new(Arc::new(memory_store()));
/// let (commit, refresh, cleanup) = logging::middleware();
/// store.use_middleware(commit, refresh, cleanup);
///
/// // Share the wrapper with aggregates as an Arc<dyn EventStore>.
/// let store = Arc::new(store);
/// # let _ = store;
/// ```
pub struct MiddlewareStore {
    inner: Arc<dyn EventStore>,
    commit: Vec<CommitMiddleware>,
    refresh: Vec<RefreshMiddleware>,
    cleanup: Mutex<Vec<Cleanup>>,
    closed: AtomicBool,
}

impl MiddlewareStore {
    /// Wrap a base store. Register middleware before sharing the wrapper.
    pub fn new(inner: Arc<dyn EventStore>) -> MiddlewareStore {
        MiddlewareStore {
            inner,
            commit: Vec::new(),
            refresh: Vec::new(),
            cleanup: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a commit middleware, a refresh middleware, and a cleanup
    /// hook together. The triple this takes is what the middleware
    /// factories in [`crate::snapshot`], [`crate::publish`], and
    /// [`crate::logging`] return.
    pub fn use_middleware(
        &mut self,
        commit: CommitMiddleware,
        refresh: RefreshMiddleware,
        cleanup: Cleanup,
    ) {
        self.handle_commit(commit);
        self.handle_refresh(refresh);
        self.handle_cleanup(cleanup);
    }

    /// Register middleware for commit operations only.
    pub fn handle_commit(&mut self, middleware: CommitMiddleware) {
        self.commit.push(middleware);
    }

    /// Register middleware for refresh operations only.
    pub fn handle_refresh(&mut self, middleware: RefreshMiddleware) {
        self.refresh.push(middleware);
    }

    /// Register a cleanup hook to run at close.
    pub fn handle_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup
            .lock()
            .expect("cleanup mutex poisoned")
            .push(cleanup);
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn EventStore> {
        &self.inner
    }
}

fn run_commit(
    chain: &[CommitMiddleware],
    inner: &dyn EventStore,
    writer: &dyn StoreWriter,
) -> Result<(), Fault> {
    match chain.split_last() {
        None => inner.commit_events(writer),
        Some((outer, rest)) => outer(writer, &mut |writer| run_commit(rest, inner, writer)),
    }
}

fn run_refresh(
    chain: &[RefreshMiddleware],
    inner: &dyn EventStore,
    loader: &mut dyn StoreLoader,
) -> Result<(), Fault> {
    match chain.split_last() {
        None => inner.refresh(loader),
        Some((outer, rest)) => outer(loader, &mut |loader| run_refresh(rest, inner, loader)),
    }
}

impl EventStore for MiddlewareStore {
    fn commit_events(&self, writer: &dyn StoreWriter) -> Result<(), Fault> {
        run_commit(&self.commit, self.inner.as_ref(), writer)
    }

    fn refresh(&self, loader: &mut dyn StoreLoader) -> Result<(), Fault> {
        run_refresh(&self.refresh, self.inner.as_ref(), loader)
    }

    /// Run every cleanup hook in registration order, then close the inner
    /// store. The first cleanup fault wins, but the remaining hooks still
    /// run. Closing is single-shot: later calls are no-ops.
    fn close(&self) -> Result<(), Fault> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_fault = None;
        let mut hooks = self.cleanup.lock().expect("cleanup mutex poisoned");
        for hook in hooks.iter_mut() {
            if let Err(fault) = hook() {
                first_fault.get_or_insert(fault);
            }
        }

        let inner_result = self.inner.close();
        match first_fault {
            Some(fault) => Err(fault),
            None => inner_result,
        }
    }
}
