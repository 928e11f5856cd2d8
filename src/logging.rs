//! Store middleware that logs commit and refresh operations via `tracing`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::middleware::{Cleanup, CommitMiddleware, RefreshMiddleware};

/// Create a logging middleware triple.
///
/// Emits a `debug` record when an operation starts and completes, and an
/// `error` record when it fails, tagged with the aggregate key, sequence
/// number, pending event count, and a per-middleware call counter.
pub fn middleware() -> (CommitMiddleware, RefreshMiddleware, Cleanup) {
    let calls = Arc::new(AtomicU64::new(0));

    let commit_calls = Arc::clone(&calls);
    let commit: CommitMiddleware = Box::new(move |writer, next| {
        let call = commit_calls.fetch_add(1, Ordering::Relaxed);
        let (_, events) = writer.uncommitted();
        let key = writer.key().to_string();
        let seq = writer.sequence_number();

        tracing::debug!(key = %key, seq, call, events = events.len(), "commit_start");
        match next(writer) {
            Err(fault) => {
                tracing::error!(key = %key, seq, call, error = %fault, "commit_error");
                Err(fault)
            }
            Ok(()) => {
                tracing::debug!(key = %key, seq, call, "commit_complete");
                Ok(())
            }
        }
    });

    let refresh_calls = Arc::clone(&calls);
    let refresh: RefreshMiddleware = Box::new(move |loader, next| {
        let call = refresh_calls.fetch_add(1, Ordering::Relaxed);
        let key = loader.key().to_string();
        let seq = loader.sequence_number();

        tracing::debug!(key = %key, seq, call, "refresh_start");
        match next(loader) {
            Err(fault) => {
                tracing::error!(key = %key, seq, call, error = %fault, "refresh_error");
                Err(fault)
            }
            Ok(()) => {
                tracing::debug!(key = %key, seq, call, "refresh_complete");
                Ok(())
            }
        }
    });

    let cleanup: Cleanup = Box::new(|| {
        tracing::debug!("middleware_shutdown");
        Ok(())
    });

    (commit, refresh, cleanup)
}
