//! The replay/tail loop: the only writer of a base's local store.

use std::sync::Arc;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use toka_kv_types::event::{Event, EventKind, MetaData};
use toka_kv_types::log::{LogClient, LogMessage};
use toka_kv_types::stats::{Operation as StatsOperation, StatsEvent};
use toka_kv_types::store::LocalStore;

use crate::barrier::SequenceBarrier;
use crate::registry::SubscriptionRegistry;
use crate::stats::StatsEmitter;

/// Hook invoked in projection order for every applied event, before
/// `oldData` is attached. Best-effort: the hook cannot fail the projection.
pub type OnMessageHook = Arc<dyn Fn(&Event) + Send + Sync>;

/// The replay/tail task for one base.
///
/// Construction alone performs the startup protocol (checkpoint read,
/// target-sequence capture, consumer open); [`Projector::start`] spawns the
/// loop and returns a handle used to await readiness and to shut it down.
pub struct Projector;

impl Projector {
    /// Runs the startup protocol and spawns the tail loop as a background
    /// task.
    pub async fn start(
        stream: String,
        log: Arc<dyn LogClient>,
        store: Arc<dyn LocalStore>,
        registry: Arc<SubscriptionRegistry>,
        barrier: Arc<SequenceBarrier>,
        on_message: Option<OnMessageHook>,
        stats: Option<Arc<StatsEmitter>>,
    ) -> Result<ProjectorHandle, toka_kv_types::error::KvError> {
        log.ensure_stream(&stream).await?;
        let checkpoint = store.get_checkpoint().await?;
        let target_seq = log.last_seq(&stream).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let already_caught_up = target_seq == 0 || checkpoint >= target_seq;
        let ready_tx = if already_caught_up {
            let _ = ready_tx.send(());
            None
        } else {
            Some(ready_tx)
        };

        let mut consumer = log.open_consumer(&stream, checkpoint + 1).await?;
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = shutdown.clone();

        let join: JoinHandle<()> = tokio::spawn(async move {
            let mut ready_tx = ready_tx;
            loop {
                tokio::select! {
                    _ = shutdown_for_task.notified() => break,
                    next = consumer.next() => {
                        match next {
                            Ok(Some(msg)) => {
                                let seq = msg.seq;
                                if let Err(e) = apply_event(
                                    &store,
                                    &registry,
                                    &barrier,
                                    on_message.as_deref(),
                                    stats.as_deref(),
                                    msg,
                                )
                                .await
                                {
                                    tracing::error!(error = %e, seq, "projection failed, closing base");
                                    barrier.close();
                                    break;
                                }
                                let _ = consumer.ack(seq).await;
                                if seq >= target_seq {
                                    if let Some(tx) = ready_tx.take() {
                                        let _ = tx.send(());
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(error = %e, "log consumer failed, closing base");
                                barrier.close();
                                break;
                            }
                        }
                    }
                }
            }
            let _ = consumer.close().await;
            barrier.close();
        });

        Ok(ProjectorHandle {
            shutdown,
            ready_rx: std::sync::Mutex::new(Some(ready_rx)),
            join: std::sync::Mutex::new(Some(join)),
        })
    }
}

/// Applies one log message to the store, in the order steps 1-7 of the
/// component design: parse, observer hook, prior-value read, upsert/remove,
/// subscriber fan-out, barrier release, checkpoint persist. Acknowledgement
/// happens in the caller once this returns successfully.
async fn apply_event(
    store: &Arc<dyn LocalStore>,
    registry: &Arc<SubscriptionRegistry>,
    barrier: &Arc<SequenceBarrier>,
    on_message: Option<&(dyn Fn(&Event) + Send + Sync)>,
    stats: Option<&StatsEmitter>,
    msg: LogMessage,
) -> Result<(), toka_kv_types::error::KvError> {
    let mut event = Event::from_wire_bytes(&msg.payload)?;

    if let Some(hook) = on_message {
        hook(&event);
    }

    let prior = store.get_doc(&event.id).await?;
    event.old_data = prior;

    let fired = match event.kind {
        EventKind::Put => {
            let data = event.data.clone().unwrap_or(serde_json::Value::Null);
            let mut doc = data;
            if let serde_json::Value::Object(ref mut obj) = doc {
                obj.insert("id".to_string(), serde_json::Value::String(event.id.clone()));
            }
            store.upsert_doc(&event.id, doc.clone()).await?;

            let time_ms = msg.time.timestamp_millis();
            let meta = match store.get_meta(&event.id).await? {
                Some(mut m) => {
                    m.record_put(time_ms);
                    m
                }
                None => MetaData::new_lineage(time_ms),
            };
            store.upsert_meta(&event.id, meta.clone()).await?;

            registry.notify_put(&event.id, &doc, &meta, &event)
        }
        EventKind::Delete => {
            store.remove_doc(&event.id).await?;
            store.remove_meta(&event.id).await?;
            let old_data = event.old_data.clone().unwrap_or(serde_json::Value::Null);
            registry.notify_delete(&event.id, &old_data, &event)
        }
    };

    if let (Some(stats), true) = (stats, fired > 0) {
        stats
            .emit(StatsEvent {
                operation: StatsOperation::SubscribeEmit,
                id: Some(event.id.clone()),
                pattern: None,
                query: None,
                query_result_count: Some(fired),
                timestamp: chrono::Utc::now().timestamp_millis(),
                duration: 0,
            })
            .await;
    }

    barrier.release(msg.seq);
    store.set_checkpoint(msg.seq).await?;
    Ok(())
}

/// A running [`Projector`] task.
pub struct ProjectorHandle {
    shutdown: Arc<Notify>,
    ready_rx: std::sync::Mutex<Option<oneshot::Receiver<()>>>,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProjectorHandle {
    /// Waits until the projector has caught up to the sequence captured at
    /// startup. Resolves immediately on a second call.
    pub async fn wait_ready(&self) -> Result<(), toka_kv_types::error::KvError> {
        let rx = self.ready_rx.lock().unwrap().take();
        if let Some(rx) = rx {
            rx.await.map_err(|_| {
                toka_kv_types::error::KvError::LogUnavailable(
                    "projector stopped before startup completed".to_string(),
                )
            })?;
        }
        Ok(())
    }

    /// Signals the tail loop to stop after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Awaits the tail loop's task to actually finish.
    pub async fn join(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
