//! Best-effort telemetry publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use toka_kv_types::log::LogClient;
use toka_kv_types::stats::StatsEvent;

/// Publishes [`StatsEvent`]s to `<stream>.stats`. Failures are logged and
/// swallowed; stats publishing never fails a public operation.
///
/// A `StatsEmitter` publishes through the same [`LogClient`] session as its
/// owning `Base`, rather than holding a connection of its own; `close`
/// therefore just stops further emission rather than tearing down a second
/// session — the shared `LogClient` is closed once, by `Base::close`.
pub struct StatsEmitter {
    log: Arc<dyn LogClient>,
    stream: String,
    closed: AtomicBool,
}

impl StatsEmitter {
    /// Builds an emitter that publishes onto `stream`.
    pub fn new(log: Arc<dyn LogClient>, stream: String) -> Self {
        Self {
            log,
            stream,
            closed: AtomicBool::new(false),
        }
    }

    /// Ensures the stats stream exists. Best-effort; failures are logged.
    pub async fn ensure_stream(&self) {
        if let Err(e) = self.log.ensure_stream(&self.stream).await {
            tracing::warn!(error = %e, stream = %self.stream, "failed to ensure stats stream");
        }
    }

    /// Publishes `event`, logging and swallowing any failure. A no-op once
    /// `close` has been called.
    pub async fn emit(&self, event: StatsEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let subject = format!("{}.stats", self.stream);
        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize stats event");
                return;
            }
        };
        if let Err(e) = self.log.publish(&self.stream, &subject, payload).await {
            tracing::warn!(error = %e, operation = ?event.operation, "stats publish failed");
        }
    }

    /// Stops further emission. Called once by `Base::close`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
