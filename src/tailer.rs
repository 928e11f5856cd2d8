//! Change-log tailing: republish events from a backend's change feed.
//!
//! Stores whose backends emit an ordered change feed (an append-only log,
//! an oplog, CDC) can drive distribution from the feed instead of the
//! post-commit publish middleware, making delivery independent of the
//! committing process. The tailer follows the feed on a dedicated thread,
//! decodes inserted event records, republishes them, and tracks its
//! position durably.
//!
//! The position advances only after a successful publish, so a crashed or
//! failed tailer redelivers from its last recorded position: delivery is
//! at-least-once. If the publisher accepts an event but a downstream
//! consumer drops it, the tailer cannot detect that; the publisher's
//! acknowledgement is the delivery boundary.

use std::sync::Arc;
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::decode::from_value_weak;
use crate::event::Event;
use crate::fault::Fault;
use crate::publish::EventPublisher;
use crate::registry::EventRegistry;
use crate::store::KeyedEvent;

/// Sentinel start position: from the beginning of the change log.
pub const TRIM_HORIZON: i64 = -2;

/// Sentinel start position: from the current tail of the change log.
pub const EDGE: i64 = -1;

/// Durable record of how far a tailer has progressed.
pub trait ProgressTracker: Send {
    /// The position to start tailing from. New trackers return their
    /// configured initial position ([`TRIM_HORIZON`], [`EDGE`], or a
    /// concrete one).
    fn start_position(&self) -> Result<i64, Fault>;

    /// Record that everything up to `position` has been republished.
    fn update_position(&mut self, position: i64) -> Result<(), Fault>;
}

/// What a change feed did to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    /// A new document was inserted. Only inserts are republished.
    Insert,
    /// The document was updated in place.
    Update,
    /// The document was deleted.
    Delete,
}

/// One entry from a backend's change feed.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// Monotonic feed position (timestamp, LSN, or offset).
    pub position: i64,
    /// Database (or equivalent namespace) the change occurred in.
    pub database: String,
    /// Collection (or table) the change occurred in.
    pub collection: String,
    /// The operation performed.
    pub operation: ChangeOperation,
    /// The affected document.
    pub document: Value,
}

/// An ordered change feed a backend exposes.
///
/// Implementations resolve the [`TRIM_HORIZON`] and [`EDGE`] sentinels in
/// [`seek`](ChangeFeed::seek) according to the backend's own position
/// scheme.
pub trait ChangeFeed: Send {
    /// Position the feed so that [`next`](ChangeFeed::next) returns
    /// changes after `from`.
    fn seek(&mut self, from: i64) -> Result<(), Fault>;

    /// Wait up to `timeout` for the next change. `Ok(None)` means nothing
    /// arrived yet.
    fn next(&mut self, timeout: Duration) -> Result<Option<ChangeRecord>, Fault>;
}

/// Scope and timing configuration for a tailer.
#[derive(Debug, Clone)]
pub struct TailerOptions {
    /// Database to watch.
    pub database: String,
    /// Collection to watch.
    pub collection: String,
    /// How long one feed poll may block.
    pub poll_timeout: Duration,
    /// Pause after a feed error before polling again.
    pub error_backoff: Duration,
}

impl TailerOptions {
    /// Options scoped to one database and collection, with default timing.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> TailerOptions {
        TailerOptions {
            database: database.into(),
            collection: collection.into(),
            poll_timeout: Duration::from_millis(200),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Handle to a running tailer thread.
pub struct TailerHandle {
    terminate: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl TailerHandle {
    /// Signal the tailer to drain and exit, then wait for it.
    pub fn stop(self) -> Result<(), Fault> {
        // The thread also exits when the sender is gone, so a send failure
        // only means it is already on its way out.
        let _ = self.terminate.send(());
        self.thread
            .join()
            .map_err(|_| Fault::backend(std::io::Error::other("tailer thread panicked")))
    }
}

/// Start tailing a change feed on a dedicated thread.
///
/// Reads the tracker's start position, seeks the feed there, and then
/// republishes every insert in the configured scope through `publisher`.
/// The tailer is the one component that logs and continues on faults: its
/// position discipline guarantees eventual redelivery after publisher
/// errors, and feed errors back off briefly before the next poll.
///
/// # Errors
///
/// Faults from the tracker's `start_position` or the feed's initial seek
/// surface immediately; nothing is spawned in that case.
pub fn start_tailer(
    mut feed: Box<dyn ChangeFeed>,
    registry: Arc<EventRegistry>,
    publisher: Arc<dyn EventPublisher>,
    mut tracker: Box<dyn ProgressTracker>,
    options: TailerOptions,
) -> Result<TailerHandle, Fault> {
    let start = tracker.start_position()?;
    feed.seek(start)?;

    let (terminate, signals) = mpsc::channel();
    let thread = thread::spawn(move || {
        tracing::info!(
            database = %options.database,
            collection = %options.collection,
            start,
            "tailing change log"
        );

        loop {
            match signals.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    tracing::info!("received shutdown signal, exiting");
                    return;
                }
                Err(TryRecvError::Empty) => {}
            }

            let record = match feed.next(options.poll_timeout) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(fault) => {
                    tracing::error!(error = %fault, "change feed error, backing off");
                    thread::sleep(options.error_backoff);
                    continue;
                }
            };

            if record.operation != ChangeOperation::Insert
                || record.database != options.database
                || record.collection != options.collection
            {
                continue;
            }

            let change = match decode_change_document(record.document, &registry) {
                Ok(change) => change,
                Err(fault) => {
                    tracing::warn!(error = %fault, "skipping change record (unable to decode)");
                    continue;
                }
            };

            if let Err(fault) = publisher.publish(&change.key, change.sequence, &change.event) {
                // Not advancing the position keeps the event eligible for
                // redelivery on restart.
                tracing::error!(error = %fault, "publish failed, position not advanced");
                continue;
            }

            if let Err(fault) = tracker.update_position(record.position) {
                tracing::error!(error = %fault, "failed to record tail position");
                continue;
            }
        }
    });

    Ok(TailerHandle { terminate, thread })
}

struct DecodedChange {
    key: String,
    sequence: i64,
    event: Event,
}

/// Two-pass decode of a change document: the outer keyed-event envelope
/// first, then the typed payload through the registry.
fn decode_change_document(
    document: Value,
    registry: &EventRegistry,
) -> Result<DecodedChange, Fault> {
    let envelope: KeyedEvent = from_value_weak(document)?;
    let event = registry.decode(&envelope.event_type, envelope.data)?;

    Ok(DecodedChange {
        key: envelope.key,
        sequence: envelope.sequence,
        event,
    })
}

/// Progress tracker holding its position in memory.
///
/// Useful for tests and for tailers whose redelivery window may restart
/// from the configured initial position on every boot.
#[derive(Debug)]
pub struct MemoryTracker {
    initial: i64,
    position: Option<i64>,
}

impl MemoryTracker {
    /// Create a tracker that starts at `initial` until a position is
    /// recorded.
    pub fn new(initial: i64) -> MemoryTracker {
        MemoryTracker {
            initial,
            position: None,
        }
    }

    /// The last recorded position, if any.
    pub fn position(&self) -> Option<i64> {
        self.position
    }
}

impl ProgressTracker for MemoryTracker {
    fn start_position(&self) -> Result<i64, Fault> {
        Ok(self.position.unwrap_or(self.initial))
    }

    fn update_position(&mut self, position: i64) -> Result<(), Fault> {
        self.position = Some(position);
        Ok(())
    }
}
