//! Snapshot middleware: cache aggregate state to shortcut replay.
//!
//! [`middleware`] turns any [`SnapshotBackend`] into a commit/refresh
//! interceptor for a [`crate::MiddlewareStore`]. Two modes:
//!
//! - **Interval**: a snapshot is written whenever a commit crosses a
//!   multiple of `interval`, so refresh replays at most `interval` events
//!   past the snapshot.
//! - **Lazy**: a snapshot is written on every commit and trusted
//!   completely on refresh; the inner store is not consulted while the
//!   cache holds an entry. Staleness is accepted: a conflicting commit
//!   purges the stale entry, and the retry refreshes from the inner
//!   store.
//!
//! Two backends ship with the crate: [`MemorySnapshots`] (a map under a
//! mutex) and [`FileSnapshots`] (one JSON file per key with atomic
//! temp-rename writes).

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fault::Fault;
use crate::middleware::{Cleanup, CommitMiddleware, RefreshMiddleware};

/// A point-in-time capture of aggregate state and its stream position.
///
/// A snapshot at sequence N is a cache of the result of applying events
/// 1..=N in order; events N+1.. must still be replayed on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of events folded into `state`.
    pub sequence: i64,
    /// Serialized aggregate state.
    pub state: Value,
}

/// Storage for per-key snapshots.
pub trait SnapshotBackend: Send + Sync {
    /// Fetch the snapshot for a key, if any.
    fn get(&self, key: &str) -> Result<Option<Snapshot>, Fault>;

    /// Store a snapshot, superseding any earlier one for the key.
    fn put(&self, key: &str, snapshot: Snapshot) -> Result<(), Fault>;

    /// Drop the snapshot for a key. Absent keys are not an error.
    fn purge(&self, key: &str) -> Result<(), Fault>;

    /// Release backend resources.
    fn close(&self) -> Result<(), Fault>;
}

/// Configuration for the snapshot middleware.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotParams {
    /// Events between snapshots in interval mode. Must be positive.
    pub interval: i64,
    /// Snapshot on every commit and trust the cache on refresh.
    pub lazy: bool,
}

/// Turn a snapshot backend into a middleware triple.
///
/// # Examples
///
/// ```
/// use keyfold::snapshot::{self, MemorySnapshots, SnapshotParams};
/// use keyfold::{memory_store, MiddlewareStore};
/// use std::sync::Arc;
///
/// let mut store = MiddlewareStore::new(Arc::new(memory_store()));
/// let (commit, refresh, cleanup) = snapshot::middleware(
///     Arc::new(MemorySnapshots::new()),
///     SnapshotParams { interval: 100, lazy: false },
/// );
/// store.use_middleware(commit, refresh, cleanup);
/// ```
///
/// # Panics
///
/// Panics when `params.interval` is not positive; the boundary arithmetic
/// is undefined without a real interval.
pub fn middleware(
    backend: Arc<dyn SnapshotBackend>,
    params: SnapshotParams,
) -> (CommitMiddleware, RefreshMiddleware, Cleanup) {
    assert!(
        params.interval > 0,
        "snapshot interval must be positive, got {}",
        params.interval
    );

    let commit_backend = Arc::clone(&backend);
    let commit: CommitMiddleware = Box::new(move |writer, next| {
        // Persist through the inner store first; a snapshot must never
        // describe state that was not durably written.
        if let Err(fault) = next(writer) {
            if params.lazy && fault.is_concurrency() {
                commit_backend.purge(writer.key())?;
            }
            return Err(fault);
        }

        let (start, events) = writer.uncommitted();
        let count = events.len() as i64;
        let end = start + count;
        let boundary = start - (start % params.interval) + params.interval;
        if !(params.lazy || end >= boundary) {
            return Ok(());
        }

        let state = writer.state()?;
        commit_backend.put(
            writer.key(),
            Snapshot {
                sequence: end,
                state,
            },
        )
    });

    let refresh_backend = Arc::clone(&backend);
    let refresh: RefreshMiddleware = Box::new(move |loader, next| {
        if loader.is_dirty() {
            return Err(Fault::DirtyAggregate {
                key: loader.key().to_string(),
            });
        }

        let mut restored = false;
        if let Some(snapshot) = refresh_backend.get(loader.key())? {
            match loader.restore_snapshot(snapshot.sequence, &snapshot.state) {
                Ok(()) => restored = true,
                Err(fault) => {
                    // An unreadable snapshot is a cache miss: drop it and
                    // fall through to a full replay.
                    tracing::warn!(
                        key = loader.key(),
                        error = %fault,
                        "snapshot restore failed; purging and replaying from the store"
                    );
                    refresh_backend.purge(loader.key())?;
                }
            }
        }

        if params.lazy && restored {
            return Ok(());
        }
        next(loader)
    });

    let close_backend = Arc::clone(&backend);
    let cleanup: Cleanup = Box::new(move || close_backend.close());

    (commit, refresh, cleanup)
}

/// Snapshot backend holding entries in a process-local map.
#[derive(Default)]
pub struct MemorySnapshots {
    snaps: Mutex<HashMap<String, Snapshot>>,
}

impl MemorySnapshots {
    /// Create an empty in-memory snapshot backend.
    pub fn new() -> MemorySnapshots {
        MemorySnapshots::default()
    }
}

impl SnapshotBackend for MemorySnapshots {
    fn get(&self, key: &str) -> Result<Option<Snapshot>, Fault> {
        let snaps = self.snaps.lock().expect("snapshot mutex poisoned");
        Ok(snaps.get(key).cloned())
    }

    fn put(&self, key: &str, snapshot: Snapshot) -> Result<(), Fault> {
        let mut snaps = self.snaps.lock().expect("snapshot mutex poisoned");
        snaps.insert(key.to_string(), snapshot);
        Ok(())
    }

    fn purge(&self, key: &str) -> Result<(), Fault> {
        let mut snaps = self.snaps.lock().expect("snapshot mutex poisoned");
        snaps.remove(key);
        Ok(())
    }

    fn close(&self) -> Result<(), Fault> {
        let mut snaps = self.snaps.lock().expect("snapshot mutex poisoned");
        snaps.clear();
        Ok(())
    }
}

/// Snapshot backend storing one JSON file per key.
///
/// Files live at `<base_dir>/<key>/snapshot.json`. Writes go to a
/// temporary file in the same directory and are renamed into place, so
/// readers never observe a partially written snapshot. A file that fails
/// to parse is treated as a cache miss.
pub struct FileSnapshots {
    base_dir: PathBuf,
}

impl FileSnapshots {
    /// Create a file-backed snapshot store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> FileSnapshots {
        FileSnapshots {
            base_dir: base_dir.into(),
        }
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key).join("snapshot.json")
    }
}

impl SnapshotBackend for FileSnapshots {
    fn get(&self, key: &str) -> Result<Option<Snapshot>, Fault> {
        let path = self.snapshot_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(Fault::backend(error)),
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse snapshot file; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, snapshot: Snapshot) -> Result<(), Fault> {
        let path = self.snapshot_path(key);
        let dir = path
            .parent()
            .expect("snapshot paths always have a parent directory");
        std::fs::create_dir_all(dir).map_err(Fault::backend)?;

        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(Fault::backend)?;
        std::fs::rename(&tmp_path, &path).map_err(Fault::backend)?;
        Ok(())
    }

    fn purge(&self, key: &str) -> Result<(), Fault> {
        match std::fs::remove_file(self.snapshot_path(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Fault::backend(error)),
        }
    }

    fn close(&self) -> Result<(), Fault> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateRoot;
    use crate::memory::memory_store;
    use crate::middleware::MiddlewareStore;
    use crate::store::EventStore;
    use crate::testkit::{IncrementEvent, InitializeEvent, SimpleCounter, test_registry};
    use serde_json::json;

    fn wrapped_store(
        backend: Arc<dyn SnapshotBackend>,
        params: SnapshotParams,
    ) -> (Arc<dyn EventStore>, Arc<dyn EventStore>) {
        let inner: Arc<dyn EventStore> = Arc::new(memory_store());
        let mut wrapper = MiddlewareStore::new(inner.clone());
        let (commit, refresh, cleanup) = middleware(backend, params);
        wrapper.use_middleware(commit, refresh, cleanup);
        (Arc::new(wrapper), inner)
    }

    fn counter(store: &Arc<dyn EventStore>, key: &str) -> AggregateRoot<SimpleCounter> {
        AggregateRoot::initialize(key, test_registry(), store.clone())
    }

    fn commit_increments(
        store: &Arc<dyn EventStore>,
        key: &str,
        count: usize,
    ) {
        for _ in 0..count {
            let mut aggregate = counter(store, key);
            aggregate.refresh().expect("refresh should succeed");
            aggregate.apply(IncrementEvent { increment_by: 1 });
            aggregate.commit().expect("commit should succeed");
        }
    }

    #[test]
    fn interval_mode_snaps_exactly_at_the_boundary() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 5,
                lazy: false,
            },
        );

        commit_increments(&store, "boundary-key", 4);
        assert!(
            backend.get("boundary-key").unwrap().is_none(),
            "no snapshot before the interval boundary"
        );

        commit_increments(&store, "boundary-key", 1);
        let snapshot = backend
            .get("boundary-key")
            .unwrap()
            .expect("a snapshot must exist at sequence = interval");
        assert_eq!(snapshot.sequence, 5);
    }

    #[test]
    fn interval_mode_snaps_when_a_commit_spans_the_boundary() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 5,
                lazy: false,
            },
        );

        // One commit of 7 events crosses the first boundary; the snapshot
        // lands at the commit's end, within the second interval.
        let mut aggregate = counter(&store, "span-key");
        aggregate.refresh().expect("refresh should succeed");
        for _ in 0..7 {
            aggregate.apply(IncrementEvent { increment_by: 1 });
        }
        aggregate.commit().expect("commit should succeed");

        let snapshot = backend
            .get("span-key")
            .unwrap()
            .expect("a spanning commit must snapshot");
        assert_eq!(snapshot.sequence, 7);
    }

    #[test]
    fn snapshots_supersede_earlier_ones() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 5,
                lazy: false,
            },
        );

        commit_increments(&store, "k", 5);
        assert_eq!(backend.get("k").unwrap().unwrap().sequence, 5);

        commit_increments(&store, "k", 7);
        assert_eq!(
            backend.get("k").unwrap().unwrap().sequence,
            10,
            "the boundary at 10 supersedes the snapshot at 5"
        );
    }

    #[test]
    fn refresh_restores_the_snapshot_and_replays_the_tail() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 5,
                lazy: false,
            },
        );

        commit_increments(&store, "k", 12);

        let mut fresh = counter(&store, "k");
        fresh.refresh().expect("refresh should succeed");
        assert_eq!(fresh.state().current_count, 12);
        assert_eq!(fresh.sequence_number(), 12);
        assert_eq!(fresh.committed_sequence(), 12);
    }

    #[test]
    fn lazy_mode_snapshots_every_commit_and_skips_the_inner_store() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, inner) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 100,
                lazy: true,
            },
        );

        commit_increments(&store, "k", 2);
        assert_eq!(
            backend.get("k").unwrap().unwrap().sequence,
            2,
            "lazy mode snapshots on every commit"
        );

        // Write an event to the inner store behind the wrapper's back; a
        // lazy refresh must not see it while the cache holds an entry.
        {
            let mut direct = counter(&inner, "k");
            direct.refresh().expect("refresh should succeed");
            direct.apply(IncrementEvent { increment_by: 10 });
            direct.commit().expect("commit should succeed");
        }

        let mut stale = counter(&store, "k");
        stale.refresh().expect("refresh should succeed");
        assert_eq!(
            stale.state().current_count,
            2,
            "lazy refresh trusts the cached snapshot"
        );
    }

    #[test]
    fn lazy_conflict_purges_the_cache_and_recovers() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, inner) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 100,
                lazy: true,
            },
        );

        commit_increments(&store, "k", 1);

        // A competing writer commits sequence 2 directly to the inner store.
        {
            let mut direct = counter(&inner, "k");
            direct.refresh().expect("refresh should succeed");
            direct.apply(IncrementEvent { increment_by: 10 });
            direct.commit().expect("commit should succeed");
        }

        // The lazy aggregate refreshes from its stale cache and collides.
        let mut stale = counter(&store, "k");
        stale.refresh().expect("refresh should succeed");
        assert_eq!(stale.state().current_count, 1);
        stale.apply(IncrementEvent { increment_by: 1 });
        let fault = stale.commit().expect_err("the stale commit must collide");
        assert!(fault.is_concurrency());
        assert!(
            backend.get("k").unwrap().is_none(),
            "the conflicting commit purges the cache"
        );

        // With the cache purged, refresh reaches the inner store.
        let mut recovered = counter(&store, "k");
        recovered.refresh().expect("refresh should succeed");
        assert_eq!(recovered.state().current_count, 11);
        recovered.apply(IncrementEvent { increment_by: 1 });
        recovered.commit().expect("the retried commit should succeed");
        assert_eq!(recovered.sequence_number(), 3);
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_full_replay() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 5,
                lazy: false,
            },
        );

        commit_increments(&store, "k", 5);

        // Poison the cache with state that cannot decode.
        backend
            .put(
                "k",
                Snapshot {
                    sequence: 5,
                    state: json!({"current_count": {"not": "a number"}}),
                },
            )
            .unwrap();

        let mut fresh = counter(&store, "k");
        fresh.refresh().expect("refresh should fall back to replay");
        assert_eq!(fresh.state().current_count, 5);
        assert!(
            backend.get("k").unwrap().is_none(),
            "the unreadable snapshot is purged"
        );
    }

    #[test]
    fn refresh_rejects_dirty_aggregates() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend,
            SnapshotParams {
                interval: 5,
                lazy: false,
            },
        );

        let mut aggregate = counter(&store, "k");
        aggregate.apply(IncrementEvent { increment_by: 1 });
        let fault = aggregate.refresh().expect_err("dirty refresh must fail");
        assert!(matches!(fault, Fault::DirtyAggregate { .. }));
    }

    #[test]
    fn snapshot_state_is_a_detached_copy() {
        let backend = Arc::new(MemorySnapshots::new());
        let (store, _) = wrapped_store(
            backend.clone(),
            SnapshotParams {
                interval: 1,
                lazy: false,
            },
        );

        let mut aggregate = counter(&store, "k");
        aggregate.refresh().expect("refresh should succeed");
        aggregate.apply(InitializeEvent { target_value: 3 });
        aggregate.commit().expect("commit should succeed");

        // Mutating the aggregate afterwards must not alter the stored state.
        aggregate.apply(InitializeEvent { target_value: 9 });
        let snapshot = backend.get("k").unwrap().unwrap();
        assert_eq!(snapshot.state["target_value"], json!(3));
    }

    #[test]
    #[should_panic(expected = "snapshot interval must be positive")]
    fn zero_interval_is_rejected_at_construction() {
        let backend: Arc<dyn SnapshotBackend> = Arc::new(MemorySnapshots::new());
        let _ = middleware(
            backend,
            SnapshotParams {
                interval: 0,
                lazy: false,
            },
        );
    }

    mod file_backend {
        use super::*;

        #[test]
        fn put_then_get_roundtrips() {
            let dir = tempfile::tempdir().expect("failed to create temp dir");
            let backend = FileSnapshots::new(dir.path());

            backend
                .put(
                    "k-1",
                    Snapshot {
                        sequence: 7,
                        state: json!({"current_count": 7}),
                    },
                )
                .expect("put should succeed");

            let snapshot = backend
                .get("k-1")
                .expect("get should succeed")
                .expect("snapshot should exist");
            assert_eq!(snapshot.sequence, 7);
            assert_eq!(snapshot.state["current_count"], json!(7));
        }

        #[test]
        fn get_missing_key_is_none() {
            let dir = tempfile::tempdir().expect("failed to create temp dir");
            let backend = FileSnapshots::new(dir.path());
            assert!(backend.get("absent").expect("get should succeed").is_none());
        }

        #[test]
        fn corrupt_file_is_a_cache_miss() {
            let dir = tempfile::tempdir().expect("failed to create temp dir");
            let backend = FileSnapshots::new(dir.path());

            let path = dir.path().join("k-bad").join("snapshot.json");
            std::fs::create_dir_all(path.parent().unwrap()).expect("create dir");
            std::fs::write(&path, b"{ not json").expect("write corrupt file");

            assert!(backend.get("k-bad").expect("get should succeed").is_none());
        }

        #[test]
        fn purge_removes_the_file_and_tolerates_absence() {
            let dir = tempfile::tempdir().expect("failed to create temp dir");
            let backend = FileSnapshots::new(dir.path());

            backend
                .put(
                    "k",
                    Snapshot {
                        sequence: 1,
                        state: json!({}),
                    },
                )
                .expect("put should succeed");
            backend.purge("k").expect("purge should succeed");
            assert!(backend.get("k").unwrap().is_none());

            backend.purge("k").expect("purging again is a no-op");
        }

        #[test]
        fn writes_leave_no_temp_file_behind() {
            let dir = tempfile::tempdir().expect("failed to create temp dir");
            let backend = FileSnapshots::new(dir.path());

            backend
                .put(
                    "k",
                    Snapshot {
                        sequence: 1,
                        state: json!({}),
                    },
                )
                .expect("put should succeed");

            let final_path = dir.path().join("k").join("snapshot.json");
            assert!(final_path.exists());
            assert!(!final_path.with_extension("json.tmp").exists());
        }

        #[test]
        fn file_backend_drives_the_middleware_end_to_end() {
            let dir = tempfile::tempdir().expect("failed to create temp dir");
            let backend: Arc<dyn SnapshotBackend> = Arc::new(FileSnapshots::new(dir.path()));
            let (store, _) = wrapped_store(
                backend,
                SnapshotParams {
                    interval: 3,
                    lazy: false,
                },
            );

            commit_increments(&store, "k", 7);

            let mut fresh = counter(&store, "k");
            fresh.refresh().expect("refresh should succeed");
            assert_eq!(fresh.state().current_count, 7);
        }
    }
}
