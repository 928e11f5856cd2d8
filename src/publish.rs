//! Post-commit publication of new events.
//!
//! The publish middleware forwards each durably committed event to an
//! [`EventPublisher`], in stream order. Store and publisher are not
//! updated atomically: when the publisher fails after the store write
//! succeeded, the commit surfaces the publisher's fault even though the
//! events are durable. Delivery across that boundary is therefore
//! at-least-once; deployments that need better should tail the store's
//! change log instead (see [`crate::tailer`]) and leave this middleware
//! out.

use std::sync::Arc;

use crate::event::Event;
use crate::fault::Fault;
use crate::middleware::{Cleanup, CommitMiddleware, RefreshMiddleware};

/// A sink distributing events to other components.
pub trait EventPublisher: Send + Sync {
    /// Publish one event. When this returns `Ok`, the event is guaranteed
    /// to have been handed to the distribution mechanism.
    fn publish(&self, key: &str, sequence: i64, event: &Event) -> Result<(), Fault>;
}

/// Create a publishing middleware triple around a publisher.
///
/// Refresh operations pass through untouched.
pub fn middleware(
    publisher: Arc<dyn EventPublisher>,
) -> (CommitMiddleware, RefreshMiddleware, Cleanup) {
    let commit: CommitMiddleware = Box::new(move |writer, next| {
        let key = writer.key();
        let (start, events) = writer.uncommitted();

        next(writer)?;

        for (index, event) in events.iter().enumerate() {
            publisher.publish(key, start + 1 + index as i64, event)?;
        }
        Ok(())
    });

    let refresh: RefreshMiddleware = Box::new(|loader, next| next(loader));
    let cleanup: Cleanup = Box::new(|| Ok(()));

    (commit, refresh, cleanup)
}
