//! Predicate-keyed subscriber fan-out, driven by the Projector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::{Arc, Weak};

use serde_json::Value;

use toka_kv_types::event::{Event, MetaData};
use toka_kv_types::predicate::Predicate;

/// A subscriber callback: `(id, payload, meta, event)`. Called synchronously
/// from the Projector's applied step; must not block.
pub type Callback = Arc<dyn Fn(&str, &Value, Option<&MetaData>, &Event) + Send + Sync>;

struct Group {
    predicate: Predicate,
    callbacks: HashMap<u64, Callback>,
}

struct State {
    groups: HashMap<String, Group>,
}

/// Mapping from predicate to callback list, plus the matching and emission
/// logic the Projector invokes after applying each event.
pub struct SubscriptionRegistry {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                groups: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `callback` under `predicate`'s canonical encoding.
    pub fn register(self: &Arc<Self>, predicate: Predicate, callback: Callback) -> SubscriptionHandle {
        let canonical_key = predicate.canonical_key();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let group = state.groups.entry(canonical_key.clone()).or_insert_with(|| Group {
            predicate,
            callbacks: HashMap::new(),
        });
        group.callbacks.insert(id, callback);
        SubscriptionHandle {
            registry: Arc::downgrade(self),
            canonical_key,
            id,
        }
    }

    fn deregister(&self, canonical_key: &str, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.groups.get_mut(canonical_key) {
            group.callbacks.remove(&id);
        }
    }

    /// Fires every callback whose predicate matches `doc`, the post-state
    /// payload of a PUT. Returns the number of callbacks invoked, for
    /// `SUBSCRIBE_EMIT` stats.
    pub fn notify_put(&self, id: &str, doc: &Value, meta: &MetaData, event: &Event) -> usize {
        let state = self.state.lock().unwrap();
        let mut fired = 0;
        for group in state.groups.values() {
            if group.predicate.matches(doc) {
                for callback in group.callbacks.values() {
                    callback(id, doc, Some(meta), event);
                    fired += 1;
                }
            }
        }
        fired
    }

    /// Fires every registered callback unconditionally, with the pre-state
    /// payload of a DELETE. Predicate matching is skipped for deletes so
    /// subscribers see the removal of a key they previously matched. Returns
    /// the number of callbacks invoked, for `SUBSCRIBE_EMIT` stats.
    pub fn notify_delete(&self, id: &str, old_data: &Value, event: &Event) -> usize {
        let state = self.state.lock().unwrap();
        let mut fired = 0;
        for group in state.groups.values() {
            for callback in group.callbacks.values() {
                callback(id, old_data, None, event);
                fired += 1;
            }
        }
        fired
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An opaque dispose token for one `subscribe` call. Dropping it does not
/// unsubscribe; call [`SubscriptionHandle::unsubscribe`] explicitly.
pub struct SubscriptionHandle {
    registry: Weak<SubscriptionRegistry>,
    canonical_key: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Deregisters this exact callback. Idempotent: calling it again, or
    /// after the owning registry has already been dropped, is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.canonical_key, self.id);
        }
    }
}
