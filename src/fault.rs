//! Fault taxonomy shared by stores, aggregates, and distribution.
//!
//! Every failure the core can produce is a [`Fault`] variant, so callers can
//! discriminate concurrency collisions (retryable) from domain rejections
//! and infrastructure failures (not retryable) without string matching.
//! Nothing in the core rewraps a fault into a different kind; the one
//! exception is the key-value engine, which maps a driver's uniqueness
//! violation into [`Fault::Concurrency`].

use crate::registry::EventType;

/// A failure from the aggregate runtime, a store, or a publisher.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// A write collided with an existing (key, sequence) pair.
    ///
    /// Another writer committed first; the command can be retried against
    /// refreshed state (see [`retry`]).
    #[error("concurrency fault: {key} at {sequence}")]
    Concurrency {
        /// Aggregate key the collision occurred on.
        key: String,
        /// First sequence number that already existed.
        sequence: i64,
    },

    /// A business rule rejected the command.
    #[error("domain fault: {code} on {key}")]
    Domain {
        /// Aggregate key the command targeted.
        key: String,
        /// Application-defined fault code.
        code: String,
    },

    /// An event's label is not in the registry at commit or publish time.
    #[error("unknown event type {label}")]
    UnknownEvent {
        /// Label of the offending event.
        label: EventType,
    },

    /// A write would append after a sequence that holds no event.
    #[error("no event at sequence {sequence} for {key}: cannot append after it")]
    PreconditionMissing {
        /// Aggregate key being written.
        key: String,
        /// The sequence number that was expected to exist.
        sequence: i64,
    },

    /// Refresh was attempted while uncommitted events are buffered.
    #[error("aggregate {key} has uncommitted events")]
    DirtyAggregate {
        /// Key of the dirty aggregate.
        key: String,
    },

    /// No handler is registered for the command's type.
    #[error("unsupported command type {command}")]
    UnsupportedCommand {
        /// Simple name of the command type.
        command: String,
    },

    /// A payload could not be mapped into its typed event or state shape.
    #[error("decode fault: {0}")]
    Decode(#[from] serde_json::Error),

    /// An error propagated from a storage or transport driver.
    #[error("backend fault: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    /// Construct a concurrency fault for a (key, sequence) collision.
    pub fn concurrency(key: impl Into<String>, sequence: i64) -> Fault {
        Fault::Concurrency {
            key: key.into(),
            sequence,
        }
    }

    /// Construct a domain fault with an application-defined code.
    pub fn domain(key: impl Into<String>, code: impl Into<String>) -> Fault {
        Fault::Domain {
            key: key.into(),
            code: code.into(),
        }
    }

    /// Wrap a driver error without interpreting it.
    pub fn backend(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Fault {
        Fault::Backend(error.into())
    }

    /// True for [`Fault::Concurrency`].
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Fault::Concurrency { .. })
    }

    /// The (key, sequence) of a concurrency fault, when it is one.
    pub fn as_concurrency(&self) -> Option<(&str, i64)> {
        match self {
            Fault::Concurrency { key, sequence } => Some((key, *sequence)),
            _ => None,
        }
    }

    /// True for [`Fault::Domain`].
    pub fn is_domain(&self) -> bool {
        matches!(self, Fault::Domain { .. })
    }

    /// The (key, code) of a domain fault, when it is one.
    pub fn as_domain(&self) -> Option<(&str, &str)> {
        match self {
            Fault::Domain { key, code } => Some((key, code)),
            _ => None,
        }
    }
}

/// Re-run a closure while it fails with a concurrency fault.
///
/// The closure runs at most `limit` times (at least once). Any error other
/// than [`Fault::Concurrency`] breaks out immediately; domain faults and
/// unknown-event errors are never retried. The last error is returned when
/// the limit is exhausted.
///
/// # Examples
///
/// ```
/// use keyfold::{retry, Fault};
///
/// let mut attempts = 0;
/// let result = retry(3, || {
///     attempts += 1;
///     if attempts < 3 {
///         Err(Fault::concurrency("k", attempts))
///     } else {
///         Ok(())
///     }
/// });
/// assert!(result.is_ok());
/// assert_eq!(attempts, 3);
/// ```
pub fn retry(limit: u32, mut body: impl FnMut() -> Result<(), Fault>) -> Result<(), Fault> {
    let mut attempt: u32 = 1;
    loop {
        let last = match body() {
            Ok(()) => return Ok(()),
            Err(fault) => fault,
        };

        if !last.is_concurrency() || attempt >= limit {
            return Err(last);
        }

        attempt += 1;
    }
}
