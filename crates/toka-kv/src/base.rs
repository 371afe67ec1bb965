//! The key/value facade bound to one log stream.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;

use toka_kv_types::error::KvError;
use toka_kv_types::event::{Event, Record};
use toka_kv_types::predicate::Predicate;
use toka_kv_types::stats::{Operation as StatsOperation, StatsEvent};
use toka_kv_types::store::{LocalStore, QueryOptions};
use toka_kv_types::subject::SubjectCodec;
use toka_kv_types::log::LogClient;

use crate::barrier::SequenceBarrier;
use crate::id::generate_id;
use crate::projector::{OnMessageHook, Projector, ProjectorHandle};
use crate::registry::{Callback, SubscriptionRegistry};
use crate::stats::StatsEmitter;

/// Configuration for opening one [`Base`].
#[derive(Clone)]
pub struct BaseConfig {
    /// Log stream identity; also the subject prefix for every event this
    /// base publishes.
    pub stream_name: String,
    /// When set, enables best-effort stats publishing on this stream.
    pub stats_stream_name: Option<String>,
    /// Local store root. Informational here; the concrete [`LocalStore`] is
    /// already open by the time [`Base::open`] is called.
    pub db_path: Option<PathBuf>,
    /// Hook fired in projection order for every applied event.
    pub on_message: Option<OnMessageHook>,
}

impl BaseConfig {
    /// A minimal config naming only the stream.
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            stats_stream_name: None,
            db_path: None,
            on_message: None,
        }
    }
}

/// One logical key-value store bound to one log stream: a log session, a
/// local store projected from it, and the machinery (barrier, subscription
/// registry, projector) that ties them together.
pub struct Base {
    stream: String,
    log: Arc<dyn LogClient>,
    store: Arc<dyn LocalStore>,
    barrier: Arc<SequenceBarrier>,
    registry: Arc<SubscriptionRegistry>,
    stats: Option<Arc<StatsEmitter>>,
    projector: ProjectorHandle,
    closed: AtomicBool,
    last_accessed: Mutex<DateTime<Utc>>,
    active_subscriptions: Arc<AtomicUsize>,
}

impl Base {
    /// Opens a base: ensures the stream exists, starts the projector, and
    /// waits for it to catch up to the sequence captured at startup before
    /// returning.
    pub async fn open(
        config: BaseConfig,
        log: Arc<dyn LogClient>,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self, KvError> {
        let stream = config.stream_name.clone();
        let barrier = Arc::new(SequenceBarrier::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = if let Some(stats_stream) = config.stats_stream_name.clone() {
            let emitter = Arc::new(StatsEmitter::new(log.clone(), stats_stream));
            emitter.ensure_stream().await;
            Some(emitter)
        } else {
            None
        };

        let projector = Projector::start(
            stream.clone(),
            log.clone(),
            store.clone(),
            registry.clone(),
            barrier.clone(),
            config.on_message.clone(),
            stats.clone(),
        )
        .await?;
        projector.wait_ready().await?;

        Ok(Self {
            stream,
            log,
            store,
            barrier,
            registry,
            stats,
            projector,
            closed: AtomicBool::new(false),
            last_accessed: Mutex::new(Utc::now()),
            active_subscriptions: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn ensure_open(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KvError::InstanceClosed);
        }
        Ok(())
    }

    fn touch(&self) {
        *self.last_accessed.lock().unwrap() = Utc::now();
    }

    /// The wall-clock time of the most recent public operation, used by the
    /// [`crate::manager::Manager`]'s idle sweep.
    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock().unwrap()
    }

    /// The number of live (undisposed) subscriptions, used by the idle
    /// sweep to exempt bases with active subscribers from eviction.
    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }

    async fn emit_stats(
        &self,
        operation: StatsOperation,
        id: Option<String>,
        pattern: Option<String>,
        query: Option<Value>,
        query_result_count: Option<usize>,
        started: Instant,
    ) {
        if let Some(stats) = &self.stats {
            stats
                .emit(StatsEvent {
                    operation,
                    id,
                    pattern,
                    query,
                    query_result_count,
                    timestamp: Utc::now().timestamp_millis(),
                    duration: started.elapsed().as_millis() as i64,
                })
                .await;
        }
    }

    /// Returns the live record for `id`, or `None` if the key is not live.
    /// Reads the local store directly; no log round trip.
    pub async fn get(&self, id: &str) -> Result<Option<Record>, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();
        let doc = self.store.get_doc(id).await?;
        let result = match doc {
            None => None,
            Some(data) => {
                let meta = self.store.get_meta(id).await?.ok_or_else(|| {
                    KvError::Store(format!("metadata missing for live key {id:?}"))
                })?;
                Some(Record { meta, data })
            }
        };
        self.emit_stats(StatsOperation::Get, Some(id.to_string()), None, None, None, started)
            .await;
        Ok(result)
    }

    /// Publishes a PUT for `id`, awaits its projection, best-effort
    /// compacts prior PUT history for `id`, and returns the freshly
    /// projected record.
    pub async fn put(&self, id: &str, data: Value) -> Result<Record, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();

        let event = Event::put(id, data);
        let subject = SubjectCodec::put_subject(&self.stream, id);
        let payload = event.to_wire_bytes()?;
        let seq = self.log.publish(&self.stream, &subject, payload).await?;
        self.barrier.wait(seq).await?;

        let doc = self
            .store
            .get_doc(id)
            .await?
            .ok_or_else(|| KvError::ProjectionMissing(id.to_string(), seq))?;
        let meta = self
            .store
            .get_meta(id)
            .await?
            .ok_or_else(|| KvError::ProjectionMissing(id.to_string(), seq))?;

        if let Err(e) = self.log.purge(&self.stream, &subject, Some(1)).await {
            tracing::warn!(error = %e, key = id, "best-effort PUT compaction failed");
        }

        self.emit_stats(StatsOperation::Put, Some(id.to_string()), None, None, None, started)
            .await;
        Ok(Record { meta, data: doc })
    }

    /// Generates a fresh identifier and `put`s `data` under it.
    pub async fn insert(&self, data: Value) -> Result<(String, Record), KvError> {
        let id = generate_id();
        let record = self.put(&id, data).await?;
        Ok((id, record))
    }

    /// Publishes a DELETE for `id`, awaits its projection, and purges all
    /// PUT log history for `id`. Returns the number of PUT entries removed.
    pub async fn delete(&self, id: &str) -> Result<u64, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();

        let event = Event::delete(id);
        let delete_subject = SubjectCodec::delete_subject(&self.stream, id);
        let payload = event.to_wire_bytes()?;
        let seq = self.log.publish(&self.stream, &delete_subject, payload).await?;
        self.barrier.wait(seq).await?;

        let put_subject = SubjectCodec::put_subject(&self.stream, id);
        let purged = self.log.purge(&self.stream, &put_subject, None).await?;

        self.emit_stats(StatsOperation::Delete, Some(id.to_string()), None, None, None, started)
            .await;
        Ok(purged)
    }

    /// Lists live identifiers, optionally filtered to those matching
    /// `pattern` as a regular expression.
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();
        let keys = self.store.keys(pattern).await?;
        self.emit_stats(
            StatsOperation::Keys,
            None,
            pattern.map(str::to_string),
            None,
            None,
            started,
        )
        .await;
        Ok(keys)
    }

    /// Returns every live document matching `query`, with `options` applied.
    pub async fn query(&self, query: &Value, options: QueryOptions) -> Result<Vec<Value>, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();
        let predicate = Predicate::from_value(query).map_err(KvError::BadPredicate)?;
        let results = self.store.query(&predicate, &options).await?;
        self.emit_stats(
            StatsOperation::Query,
            None,
            None,
            Some(query.clone()),
            Some(results.len()),
            started,
        )
        .await;
        Ok(results)
    }

    /// Counts live documents matching `query`.
    pub async fn count(&self, query: &Value) -> Result<usize, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();
        let predicate = Predicate::from_value(query).map_err(KvError::BadPredicate)?;
        let count = self.store.count(&predicate).await?;
        self.emit_stats(
            StatsOperation::Query,
            None,
            None,
            Some(query.clone()),
            Some(count),
            started,
        )
        .await;
        Ok(count)
    }

    /// Registers `callback` under `query`'s canonical predicate encoding.
    /// The returned [`Subscription`] deregisters this exact callback when
    /// disposed.
    pub async fn subscribe(&self, query: &Value, callback: Callback) -> Result<Subscription, KvError> {
        self.ensure_open()?;
        self.touch();
        let started = Instant::now();
        let predicate = Predicate::from_value(query).map_err(KvError::BadPredicate)?;
        self.active_subscriptions.fetch_add(1, Ordering::SeqCst);
        let handle = self.registry.register(predicate, callback);
        self.emit_stats(
            StatsOperation::Subscribe,
            None,
            None,
            Some(query.clone()),
            None,
            started,
        )
        .await;
        Ok(Subscription {
            handle,
            active_subscriptions: self.active_subscriptions.clone(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Stops the projector and fails pending barrier waiters. Shared by
    /// `close` and `delete_stream`, which differ only in what happens to the
    /// log session and local store afterward.
    async fn shutdown_projector(&self) {
        self.projector.shutdown();
        self.barrier.close();
        self.projector.join().await;
    }

    /// Marks this base closed, stops the projector, closes the local store
    /// and the log session, and stops stats publishing. Idempotent.
    pub async fn close(&self) -> Result<(), KvError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_projector().await;
        if let Some(stats) = &self.stats {
            stats.close();
        }
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, stream = %self.stream, "failed to close local store");
        }
        if let Err(e) = self.log.close().await {
            tracing::warn!(error = %e, stream = %self.stream, "failed to close log session");
        }
        Ok(())
    }

    /// Stops the projector (if not already closed), purges and deletes the
    /// log stream, and removes the local store's on-disk data directory.
    /// Closes the log session last, after the delete has gone out over it.
    /// Terminal: the stream cannot be reused afterward.
    pub async fn delete_stream(&self) -> Result<(), KvError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown_projector().await;
        }
        self.log.delete_stream(&self.stream).await?;
        self.store.destroy().await?;
        if let Some(stats) = &self.stats {
            stats.close();
        }
        if let Err(e) = self.log.close().await {
            tracing::warn!(error = %e, stream = %self.stream, "failed to close log session");
        }
        Ok(())
    }
}

/// A dispose handle returned by [`Base::subscribe`]. Disposing it
/// deregisters the callback and decrements the base's active-subscription
/// count (clamped at zero).
pub struct Subscription {
    handle: crate::registry::SubscriptionHandle,
    active_subscriptions: Arc<AtomicUsize>,
    disposed: AtomicBool,
}

impl Subscription {
    /// Deregisters the callback. Idempotent.
    pub fn unsubscribe(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle.unsubscribe();
        let _ = self
            .active_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }
}
