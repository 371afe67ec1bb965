//! Error types shared across the Toka KV crates.

/// Errors that can occur while operating on a [`crate::event::Record`] store
/// or a base built on top of it.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The operation was attempted after the base was closed.
    #[error("instance closed")]
    InstanceClosed,

    /// A publish, consume, or admin call against the log failed.
    #[error("log unavailable: {0}")]
    LogUnavailable(String),

    /// After awaiting a sequence, the expected key was absent locally. This
    /// indicates the projector faulted between applying the event and this
    /// read, and should not happen in a healthy system.
    #[error("projection missing for key {0:?} at sequence {1}")]
    ProjectionMissing(String, u64),

    /// The underlying local store reported a failure.
    #[error("store error: {0}")]
    Store(String),

    /// A predicate referenced an unknown operator or malformed condition.
    /// The predicate is treated as non-matching rather than surfaced, except
    /// where callers ask to validate one ahead of time.
    #[error("bad predicate: {0}")]
    BadPredicate(String),

    /// Serialization or deserialization of an event/document failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
