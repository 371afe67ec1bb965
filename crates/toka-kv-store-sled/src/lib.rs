#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **toka-kv-store-sled** - sled-backed, persistent [`LocalStore`] driver for
//! Toka KV.
//!
//! Three trees per base: `docs` (id -> JSON document), `meta` (id ->
//! msgpack-encoded [`MetaData`]), and `settings` (fixed keys, currently just
//! the projector's checkpoint). All three commit independently, but since the
//! projector is the sole writer and applies one event at a time, the store
//! never observes a document written without its matching metadata for more
//! than the duration of a single projection step.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sled::{Db, Tree};

use toka_kv_types::{
    error::KvError,
    event::MetaData,
    predicate::Predicate,
    store::{apply_query_options, LocalStore, QueryOptions},
};

const CHECKPOINT_KEY: &[u8] = b"checkpoint";

fn store_err(e: impl std::fmt::Display) -> KvError {
    KvError::Store(e.to_string())
}

/// A persistent, sled-backed [`LocalStore`].
pub struct SledStore {
    _db: Db,
    docs: Tree,
    meta: Tree,
    settings: Tree,
    /// The on-disk directory this store was opened at, if any. `None` for
    /// `temporary()` and `from_db()`-wrapped databases, which own no
    /// directory this driver should remove on `destroy`.
    path: Option<PathBuf>,
}

impl SledStore {
    /// Opens or creates a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KvError> {
        Self::open_with_config(path, sled::Config::default())
    }

    /// Opens a sled database at `path` with a custom sled configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: sled::Config) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        let db = config.path(&path).open().map_err(store_err)?;
        let mut store = Self::from_db(db)?;
        store.path = Some(path);
        Ok(store)
    }

    /// Wraps an already-open sled [`Db`], opening this base's three trees
    /// within it.
    pub fn from_db(db: Db) -> Result<Self, KvError> {
        let docs = db.open_tree("docs").map_err(store_err)?;
        let meta = db.open_tree("meta").map_err(store_err)?;
        let settings = db.open_tree("settings").map_err(store_err)?;
        Ok(Self {
            _db: db,
            docs,
            meta,
            settings,
            path: None,
        })
    }

    /// Opens a temporary, self-cleaning database, for tests.
    pub fn temporary() -> Result<Self, KvError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(store_err)?;
        Self::from_db(db)
    }

    /// Flushes both trees to disk.
    pub async fn flush(&self) -> Result<(), KvError> {
        self.docs.flush_async().await.map_err(store_err)?;
        self.meta.flush_async().await.map_err(store_err)?;
        self.settings.flush_async().await.map_err(store_err)?;
        Ok(())
    }

    /// The number of live documents.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }
}

#[async_trait]
impl LocalStore for SledStore {
    async fn get_doc(&self, id: &str) -> Result<Option<Value>, KvError> {
        match self.docs.get(id).map_err(store_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn upsert_doc(&self, id: &str, doc: Value) -> Result<(), KvError> {
        let bytes = serde_json::to_vec(&doc)?;
        self.docs.insert(id, bytes).map_err(store_err)?;
        Ok(())
    }

    async fn remove_doc(&self, id: &str) -> Result<(), KvError> {
        self.docs.remove(id).map_err(store_err)?;
        Ok(())
    }

    async fn get_meta(&self, id: &str) -> Result<Option<MetaData>, KvError> {
        match self.meta.get(id).map_err(store_err)? {
            Some(bytes) => {
                let meta = rmp_serde::from_slice(&bytes).map_err(store_err)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    async fn upsert_meta(&self, id: &str, meta: MetaData) -> Result<(), KvError> {
        let bytes = rmp_serde::to_vec(&meta).map_err(store_err)?;
        self.meta.insert(id, bytes).map_err(store_err)?;
        Ok(())
    }

    async fn remove_meta(&self, id: &str) -> Result<(), KvError> {
        self.meta.remove(id).map_err(store_err)?;
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, KvError> {
        let re = pattern
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| KvError::BadPredicate(e.to_string()))?;
        let mut keys = Vec::new();
        for item in self.docs.iter() {
            let (key, _) = item.map_err(store_err)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            match &re {
                Some(re) if !re.is_match(&key) => continue,
                _ => {}
            }
            keys.push(key);
        }
        Ok(keys)
    }

    async fn query(
        &self,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Value>, KvError> {
        let mut matched = Vec::new();
        for item in self.docs.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            let doc: Value = serde_json::from_slice(&bytes)?;
            if predicate.matches(&doc) {
                matched.push(doc);
            }
        }
        Ok(apply_query_options(matched, options))
    }

    async fn count(&self, predicate: &Predicate) -> Result<usize, KvError> {
        let mut count = 0;
        for item in self.docs.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            let doc: Value = serde_json::from_slice(&bytes)?;
            if predicate.matches(&doc) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_checkpoint(&self) -> Result<u64, KvError> {
        match self.settings.get(CHECKPOINT_KEY).map_err(store_err)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    async fn set_checkpoint(&self, seq: u64) -> Result<(), KvError> {
        self.settings
            .insert(CHECKPOINT_KEY, &seq.to_be_bytes())
            .map_err(store_err)?;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), KvError> {
        self.docs.clear().map_err(store_err)?;
        self.meta.clear().map_err(store_err)?;
        self.settings.clear().map_err(store_err)?;
        self.flush().await?;
        if let Some(path) = &self.path {
            let path = path.clone();
            let removed = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
                .await
                .map_err(store_err)?;
            if let Err(e) = removed {
                tracing::warn!(error = %e, "failed to remove sled data directory; the database handle may still be open");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = SledStore::temporary().unwrap();
        store.upsert_doc("a", json!({"id": "a", "x": 1})).await.unwrap();
        assert_eq!(store.get_doc("a").await.unwrap(), Some(json!({"id": "a", "x": 1})));
        assert_eq!(store.get_doc("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn metadata_round_trips_independently_of_the_document() {
        let store = SledStore::temporary().unwrap();
        let meta = MetaData::new_lineage(1_700_000_000_000);
        store.upsert_meta("a", meta.clone()).await.unwrap();
        let fetched = store.get_meta("a").await.unwrap().unwrap();
        assert_eq!(fetched.changes, meta.changes);
        assert_eq!(fetched.date_created, meta.date_created);
    }

    #[tokio::test]
    async fn data_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = SledStore::open(&path).unwrap();
            store.upsert_doc("a", json!({"id": "a"})).await.unwrap();
            store.set_checkpoint(7).await.unwrap();
            store.flush().await.unwrap();
        }
        {
            let store = SledStore::open(&path).unwrap();
            assert_eq!(store.get_doc("a").await.unwrap(), Some(json!({"id": "a"})));
            assert_eq!(store.get_checkpoint().await.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn checkpoint_defaults_to_zero() {
        let store = SledStore::temporary().unwrap();
        assert_eq!(store.get_checkpoint().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn destroy_clears_state_and_removes_the_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let store = SledStore::open(&path).unwrap();
        store.upsert_doc("a", json!({"id": "a"})).await.unwrap();
        store.set_checkpoint(7).await.unwrap();

        store.destroy().await.unwrap();

        assert_eq!(store.get_doc("a").await.unwrap(), None);
        assert_eq!(store.get_checkpoint().await.unwrap(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn query_scans_and_filters_by_predicate() {
        let store = SledStore::temporary().unwrap();
        store.upsert_doc("a", json!({"id": "a", "age": 30})).await.unwrap();
        store.upsert_doc("b", json!({"id": "b", "age": 20})).await.unwrap();

        let predicate = Predicate::from_value(&json!({"age": {"$gte": 25}})).unwrap();
        let result = store.query(&predicate, &QueryOptions::default()).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["id"], "a");
    }
}
