#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **toka-kv-store-memory** - in-memory [`LocalStore`] driver for Toka KV.
//!
//! Non-persistent: every document, metadata record, and the projector's
//! checkpoint live only as long as the process. Suitable for tests and for
//! bases that are deliberately ephemeral.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use toka_kv_types::{
    error::KvError,
    event::MetaData,
    predicate::Predicate,
    store::{apply_query_options, LocalStore, QueryOptions},
};

/// An in-memory, non-persistent [`LocalStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<HashMap<String, Value>>>,
    meta: Arc<RwLock<HashMap<String, MetaData>>>,
    checkpoint: Arc<RwLock<u64>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live documents currently held.
    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_doc(&self, id: &str) -> Result<Option<Value>, KvError> {
        Ok(self.docs.read().await.get(id).cloned())
    }

    async fn upsert_doc(&self, id: &str, doc: Value) -> Result<(), KvError> {
        self.docs.write().await.insert(id.to_string(), doc);
        Ok(())
    }

    async fn remove_doc(&self, id: &str) -> Result<(), KvError> {
        self.docs.write().await.remove(id);
        Ok(())
    }

    async fn get_meta(&self, id: &str) -> Result<Option<MetaData>, KvError> {
        Ok(self.meta.read().await.get(id).cloned())
    }

    async fn upsert_meta(&self, id: &str, meta: MetaData) -> Result<(), KvError> {
        self.meta.write().await.insert(id.to_string(), meta);
        Ok(())
    }

    async fn remove_meta(&self, id: &str) -> Result<(), KvError> {
        self.meta.write().await.remove(id);
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, KvError> {
        let docs = self.docs.read().await;
        match pattern {
            None => Ok(docs.keys().cloned().collect()),
            Some(pattern) => {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| KvError::BadPredicate(e.to_string()))?;
                Ok(docs.keys().filter(|k| re.is_match(k)).cloned().collect())
            }
        }
    }

    async fn query(
        &self,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Value>, KvError> {
        let docs = self.docs.read().await;
        let matched: Vec<Value> = docs
            .values()
            .filter(|doc| predicate.matches(doc))
            .cloned()
            .collect();
        Ok(apply_query_options(matched, options))
    }

    async fn count(&self, predicate: &Predicate) -> Result<usize, KvError> {
        let docs = self.docs.read().await;
        Ok(docs.values().filter(|doc| predicate.matches(doc)).count())
    }

    async fn get_checkpoint(&self) -> Result<u64, KvError> {
        Ok(*self.checkpoint.read().await)
    }

    async fn set_checkpoint(&self, seq: u64) -> Result<(), KvError> {
        *self.checkpoint.write().await = seq;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), KvError> {
        self.docs.write().await.clear();
        self.meta.write().await.clear();
        *self.checkpoint.write().await = 0;
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = MemoryStore::new();
        store.upsert_doc("a", json!({"id": "a", "x": 1})).await.unwrap();
        assert_eq!(store.get_doc("a").await.unwrap(), Some(json!({"id": "a", "x": 1})));
        assert_eq!(store.get_doc("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = MemoryStore::new();
        store.remove_doc("never-existed").await.unwrap();
        store.upsert_doc("a", json!({"id": "a"})).await.unwrap();
        store.remove_doc("a").await.unwrap();
        store.remove_doc("a").await.unwrap();
        assert_eq!(store.get_doc("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_filters_by_pattern() {
        let store = MemoryStore::new();
        store.upsert_doc("user:1", json!({"id": "user:1"})).await.unwrap();
        store.upsert_doc("user:2", json!({"id": "user:2"})).await.unwrap();
        store.upsert_doc("order:1", json!({"id": "order:1"})).await.unwrap();

        let mut all = store.keys(None).await.unwrap();
        all.sort();
        assert_eq!(all, vec!["order:1", "user:1", "user:2"]);

        let mut users = store.keys(Some("^user:")).await.unwrap();
        users.sort();
        assert_eq!(users, vec!["user:1", "user:2"]);
    }

    #[tokio::test]
    async fn query_applies_predicate_and_options() {
        let store = MemoryStore::new();
        store.upsert_doc("a", json!({"id": "a", "age": 30})).await.unwrap();
        store.upsert_doc("b", json!({"id": "b", "age": 20})).await.unwrap();
        store.upsert_doc("c", json!({"id": "c", "age": 40})).await.unwrap();

        let predicate = Predicate::from_value(&json!({"age": {"$gte": 25}})).unwrap();
        let mut result = store.query(&predicate, &QueryOptions::default()).await.unwrap();
        result.sort_by_key(|d| d["id"].as_str().unwrap().to_string());
        assert_eq!(result.len(), 2);

        let count = store.count(&predicate).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn checkpoint_defaults_to_zero_and_persists_updates() {
        let store = MemoryStore::new();
        assert_eq!(store.get_checkpoint().await.unwrap(), 0);
        store.set_checkpoint(42).await.unwrap();
        assert_eq!(store.get_checkpoint().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn destroy_clears_documents_metadata_and_checkpoint() {
        let store = MemoryStore::new();
        store.upsert_doc("a", json!({"id": "a"})).await.unwrap();
        store.upsert_meta("a", MetaData::new_lineage(0)).await.unwrap();
        store.set_checkpoint(9).await.unwrap();

        store.destroy().await.unwrap();

        assert_eq!(store.get_doc("a").await.unwrap(), None);
        assert_eq!(store.get_meta("a").await.unwrap(), None);
        assert_eq!(store.get_checkpoint().await.unwrap(), 0);
    }
}
