//! The durable, ordered log the projector replays and tails.
//!
//! This is deliberately the thinnest possible abstraction over a
//! JetStream-style message-streaming system: durable, per-subject retention,
//! monotonically increasing per-stream sequence numbers, a pull consumer
//! startable at an arbitrary sequence, and per-subject purge. Concrete
//! drivers (NATS JetStream, an in-memory fake for tests) implement it; this
//! crate performs no I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::KvError;

/// One delivered message from a [`LogConsumer`].
#[derive(Clone, Debug)]
pub struct LogMessage {
    /// The stream-assigned sequence number, strictly increasing.
    pub seq: u64,
    /// The opaque payload bytes, as published.
    pub payload: Vec<u8>,
    /// The log's authoritative receipt time for this message.
    pub time: DateTime<Utc>,
}

/// A pull consumer over one stream, started at a fixed sequence.
#[async_trait]
pub trait LogConsumer: Send {
    /// Fetches the next message, blocking until one is available or the
    /// consumer is closed. Returns `None` once the consumer has been
    /// deliberately closed with no further messages pending.
    async fn next(&mut self) -> Result<Option<LogMessage>, KvError>;

    /// Acknowledges a message, signalling it need not be redelivered on
    /// restart. Acknowledgement is only meaningful after a successful
    /// `next()`; callers must ack strictly in the order messages were
    /// received.
    async fn ack(&mut self, seq: u64) -> Result<(), KvError>;

    /// Halts delivery and deletes the consumer's durable state (if any) so
    /// the log does not retain per-consumer bookkeeping after the base
    /// closes.
    async fn close(&mut self) -> Result<(), KvError>;
}

/// The external, durable, ordered log a [`crate::event::Event`] is appended
/// to and replayed from.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Creates the stream if absent, with a subject filter covering every
    /// subject this base will ever publish under. Idempotent.
    async fn ensure_stream(&self, stream: &str) -> Result<(), KvError>;

    /// Publishes `payload` to `subject` within `stream` and returns the
    /// sequence number the log assigned it.
    async fn publish(&self, stream: &str, subject: &str, payload: Vec<u8>) -> Result<u64, KvError>;

    /// The highest sequence number currently held by `stream`, or `0` if
    /// the stream is empty.
    async fn last_seq(&self, stream: &str) -> Result<u64, KvError>;

    /// Opens a pull consumer over `stream` that will first yield the
    /// message at `start_seq` (i.e. replay begins there, not after it).
    async fn open_consumer(
        &self,
        stream: &str,
        start_seq: u64,
    ) -> Result<Box<dyn LogConsumer>, KvError>;

    /// Purges log entries under `subject`, retaining the `keep` most recent
    /// (or all of them, if `keep` is `None`). Returns the number of entries
    /// removed.
    async fn purge(&self, stream: &str, subject: &str, keep: Option<u64>)
        -> Result<u64, KvError>;

    /// Purges and deletes `stream` entirely. Terminal: the stream cannot be
    /// reused afterward.
    async fn delete_stream(&self, stream: &str) -> Result<(), KvError>;

    /// Closes the session this client holds (e.g. drains and disconnects an
    /// underlying network connection). Called once by `Base::close`, after
    /// the projector has already stopped. Implementations with nothing to
    /// release (e.g. the in-memory fake) treat this as a no-op.
    async fn close(&self) -> Result<(), KvError>;
}
