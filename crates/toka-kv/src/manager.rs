//! Multi-base lifecycle: single-flight open, idle eviction, `closeAll`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use toka_kv_types::error::KvError;
use toka_kv_types::log::LogClient;
use toka_kv_types::store::LocalStore;

use crate::base::{Base, BaseConfig};
use crate::projector::OnMessageHook;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(3600);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(60_000);

/// Opens the concrete [`LocalStore`] a base named `stream_name` should use.
/// Implementations typically open a sled database under a config-supplied
/// root, or hand back a fresh in-memory store for tests.
#[async_trait]
pub trait LocalStoreFactory: Send + Sync {
    /// Opens (creating if necessary) the store for `stream_name`.
    async fn open(&self, stream_name: &str) -> Result<Arc<dyn LocalStore>, KvError>;
}

/// Event emitted by the [`Manager`] itself, at the moment it opens or
/// closes a base. Bases never emit these; the manager is a pure owner.
#[derive(Clone, Debug)]
pub enum ManagerEvent {
    /// A base's single-flight open was just initiated.
    Opened(String),
    /// A base was just closed, by `closeAll` or the idle sweep.
    Closed(String),
}

/// Configuration shared by every base the [`Manager`] opens.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Root directory for on-disk stores, if the [`LocalStoreFactory`] in
    /// use is disk-backed.
    pub db_path: Option<PathBuf>,
    /// Idle duration (with zero active subscribers) after which a base is
    /// eligible for eviction. Defaults to one hour.
    pub keep_alive: Duration,
    /// Interval between idle sweeps. Defaults to one minute.
    pub cleanup_interval: Duration,
    /// Hook installed on every base this manager opens.
    pub on_message: Option<OnMessageHook>,
    /// Derives a stats stream name for a given base name, if stats
    /// publishing should be enabled for it.
    pub stats_stream_for: Option<Arc<dyn Fn(&str) -> Option<String> + Send + Sync>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            on_message: None,
            stats_stream_for: None,
        }
    }
}

type OpenResult = Result<Arc<Base>, Arc<KvError>>;
type OpenFuture = Shared<BoxFuture<'static, OpenResult>>;

/// Owns every open [`Base`] for one process, keyed by stream name.
///
/// `getStream` coalesces concurrent openers of the same name behind a
/// single in-flight future; a background sweep closes bases that have been
/// both idle past `keep_alive` and have no active subscribers.
pub struct Manager {
    config: ManagerConfig,
    log: Arc<dyn LogClient>,
    store_factory: Arc<dyn LocalStoreFactory>,
    bases: Arc<Mutex<HashMap<String, OpenFuture>>>,
    events_tx: broadcast::Sender<ManagerEvent>,
    cleanup_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Creates a manager with no bases open yet.
    pub fn new(
        config: ManagerConfig,
        log: Arc<dyn LogClient>,
        store_factory: Arc<dyn LocalStoreFactory>,
    ) -> Arc<Self> {
        let (events_tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            config,
            log,
            store_factory,
            bases: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            cleanup_task: StdMutex::new(None),
        })
    }

    /// Subscribes to `stream:opened`/`stream:closed` notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    /// Returns the base named `name`, opening it (single-flight) if absent.
    pub async fn get_stream(self: &Arc<Self>, name: &str) -> Result<Arc<Base>, KvError> {
        let fut = {
            let mut bases = self.bases.lock().await;
            if let Some(fut) = bases.get(name) {
                fut.clone()
            } else {
                let was_empty = bases.is_empty();
                let stream_name = name.to_string();
                let log = self.log.clone();
                let factory = self.store_factory.clone();
                let config = self.config.clone();

                let opening: Pin<Box<dyn std::future::Future<Output = OpenResult> + Send>> =
                    Box::pin(async move {
                        let store = factory.open(&stream_name).await.map_err(Arc::new)?;
                        let base_config = BaseConfig {
                            stream_name: stream_name.clone(),
                            stats_stream_name: config
                                .stats_stream_for
                                .as_ref()
                                .and_then(|f| f(&stream_name)),
                            db_path: config.db_path.clone(),
                            on_message: config.on_message.clone(),
                        };
                        let base = Base::open(base_config, log, store).await.map_err(Arc::new)?;
                        Ok(Arc::new(base))
                    });
                let shared = opening.shared();
                bases.insert(name.to_string(), shared.clone());
                let _ = self.events_tx.send(ManagerEvent::Opened(name.to_string()));
                if was_empty {
                    self.spawn_cleanup_timer();
                }
                shared
            }
        };

        fut.await
            .map_err(|e| KvError::LogUnavailable(format!("base {name:?} failed to open: {e}")))
    }

    fn spawn_cleanup_timer(self: &Arc<Self>) {
        let mut guard = self.cleanup_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let bases = self.bases.clone();
        let events_tx = self.events_tx.clone();
        let keep_alive = self.config.keep_alive;
        let interval_dur = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_dur);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let mut bases = bases.lock().await;
                let mut to_remove = Vec::new();
                for (name, fut) in bases.iter() {
                    let Some(Ok(base)) = fut.clone().now_or_never() else {
                        continue;
                    };
                    let idle = idle_since(base.last_accessed());
                    if idle >= keep_alive && base.active_subscriptions() == 0 {
                        let _ = base.close().await;
                        to_remove.push(name.clone());
                    }
                }
                for name in &to_remove {
                    bases.remove(name);
                    let _ = events_tx.send(ManagerEvent::Closed(name.clone()));
                }
            }
        });
        *guard = Some(handle);
    }

    /// Stops the idle sweep, closes every open base (tolerating failures),
    /// emits `stream:closed` for each, and clears the map.
    pub async fn close_all(&self) {
        if let Some(handle) = self.cleanup_task.lock().unwrap().take() {
            handle.abort();
        }
        let mut bases = self.bases.lock().await;
        for (name, fut) in bases.drain() {
            if let Ok(base) = fut.await {
                let _ = base.close().await;
            }
            let _ = self.events_tx.send(ManagerEvent::Closed(name));
        }
    }
}

fn idle_since(since: chrono::DateTime<chrono::Utc>) -> Duration {
    let millis = chrono::Utc::now().signed_duration_since(since).num_milliseconds();
    Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toka_kv_log_memory::MemoryLogClient;
    use toka_kv_store_memory::MemoryStore;

    struct MemoryStoreFactory;

    #[async_trait]
    impl LocalStoreFactory for MemoryStoreFactory {
        async fn open(&self, _stream_name: &str) -> Result<Arc<dyn LocalStore>, KvError> {
            Ok(Arc::new(MemoryStore::new()))
        }
    }

    #[tokio::test]
    async fn get_stream_opens_once_and_reuses_the_base() {
        let manager = Manager::new(
            ManagerConfig::default(),
            Arc::new(MemoryLogClient::new()),
            Arc::new(MemoryStoreFactory),
        );
        let base1 = manager.get_stream("orders").await.unwrap();
        let base2 = manager.get_stream("orders").await.unwrap();
        assert!(Arc::ptr_eq(&base1, &base2));
    }

    #[tokio::test]
    async fn concurrent_get_stream_calls_coalesce() {
        let manager = Manager::new(
            ManagerConfig::default(),
            Arc::new(MemoryLogClient::new()),
            Arc::new(MemoryStoreFactory),
        );
        let (a, b) = tokio::join!(manager.get_stream("orders"), manager.get_stream("orders"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn close_all_closes_every_open_base() {
        let manager = Manager::new(
            ManagerConfig::default(),
            Arc::new(MemoryLogClient::new()),
            Arc::new(MemoryStoreFactory),
        );
        let base = manager.get_stream("orders").await.unwrap();
        base.put("a", json!({"x": 1})).await.unwrap();
        manager.close_all().await;
        assert!(matches!(base.get("a").await, Err(KvError::InstanceClosed)));
    }
}
