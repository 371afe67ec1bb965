//! The local, queryable document store a [`crate::event::Event`] log is
//! projected into.
//!
//! Concrete drivers (in-memory, sled-backed, ...) implement [`LocalStore`].
//! This crate only defines the contract and the options shared by every
//! `query` call; it performs no I/O itself.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::KvError;
use crate::event::MetaData;
use crate::predicate::Predicate;

/// A single field's contribution to a query's sort order.
#[derive(Clone, Debug)]
pub struct Sort {
    /// The document field to sort by.
    pub field: String,
    /// `true` for descending (the wire form's `-1`), `false` for ascending
    /// (`+1`).
    pub descending: bool,
}

/// Options accepted by [`LocalStore::query`], mirroring what the spec passes
/// through from `Base::query`.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Caps the number of documents returned.
    pub limit: Option<usize>,
    /// Skips this many matching documents before collecting results.
    pub offset: Option<usize>,
    /// Ordering to apply before `offset`/`limit`, first field taking
    /// priority over subsequent ones.
    pub sort: Vec<Sort>,
    /// When non-empty, only these fields (plus `id`) are retained in each
    /// returned document.
    pub project: Vec<String>,
}

/// Atomic per-key storage for documents, their metadata, and the
/// projector's durable checkpoint.
///
/// Implementations must serialize their own internal operations: a single
/// logical task (the projector) is the only writer, but reads may run
/// concurrently with it.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetches the live document for `id`, or `None` if absent.
    async fn get_doc(&self, id: &str) -> Result<Option<Value>, KvError>;

    /// Upserts the document for `id`.
    async fn upsert_doc(&self, id: &str, doc: Value) -> Result<(), KvError>;

    /// Removes the document for `id`. Idempotent: removing an absent key
    /// succeeds.
    async fn remove_doc(&self, id: &str) -> Result<(), KvError>;

    /// Fetches the metadata record for `id`, or `None` if the key is not
    /// live.
    async fn get_meta(&self, id: &str) -> Result<Option<MetaData>, KvError>;

    /// Upserts the metadata record for `id`.
    async fn upsert_meta(&self, id: &str, meta: MetaData) -> Result<(), KvError>;

    /// Removes the metadata record for `id`. Idempotent.
    async fn remove_meta(&self, id: &str) -> Result<(), KvError>;

    /// Lists every live key, optionally filtered to those whose identifier
    /// matches `pattern` interpreted as a regular expression applied as a
    /// substring search (i.e. `re.find` semantics, not a full-string
    /// anchor). Order is unspecified.
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, KvError>;

    /// Returns every live document matching `predicate`, with `options`
    /// applied.
    async fn query(
        &self,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Value>, KvError>;

    /// Counts live documents matching `predicate`.
    async fn count(&self, predicate: &Predicate) -> Result<usize, KvError>;

    /// Reads the last successfully projected sequence number. Implementations
    /// treat a missing or invalid value as `0` rather than erroring, since an
    /// absent checkpoint just means "nothing has been projected yet".
    async fn get_checkpoint(&self) -> Result<u64, KvError>;

    /// Atomically persists the projector's checkpoint.
    async fn set_checkpoint(&self, seq: u64) -> Result<(), KvError>;

    /// Removes every document, metadata record, and checkpoint this store
    /// holds, and — for on-disk drivers — the backing data directory itself.
    /// Called once by `Base::delete_stream` after the projector has already
    /// stopped. Best-effort: a driver that cannot remove its on-disk files
    /// (e.g. another handle still has them open) logs and returns `Ok`
    /// rather than failing the terminal operation.
    async fn destroy(&self) -> Result<(), KvError>;

    /// Flushes and releases this store's handles without deleting any data.
    /// Called once by `Base::close`, after the projector has already
    /// stopped. Implementations with nothing to release (e.g. the
    /// in-memory driver) treat this as a no-op.
    async fn close(&self) -> Result<(), KvError>;
}

/// Applies sort, offset, limit, and projection to an already-matched
/// document set, in that order. Shared by every [`LocalStore`] driver so
/// each only has to implement the predicate scan itself.
pub fn apply_query_options(mut docs: Vec<Value>, options: &QueryOptions) -> Vec<Value> {
    if !options.sort.is_empty() {
        docs.sort_by(|a, b| {
            for s in &options.sort {
                let (av, bv) = (a.get(&s.field), b.get(&s.field));
                let ord = compare_values(av, bv);
                let ord = if s.descending { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    let offset = options.offset.unwrap_or(0);
    let docs: Vec<Value> = docs.into_iter().skip(offset).collect();
    let docs: Vec<Value> = match options.limit {
        Some(limit) => docs.into_iter().take(limit).collect(),
        None => docs,
    };

    if options.project.is_empty() {
        return docs;
    }
    docs.into_iter()
        .map(|doc| project_fields(&doc, &options.project))
        .collect()
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        (Some(a), Some(b)) => return a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => {}
    }
    match (a.and_then(Value::as_str), b.and_then(Value::as_str)) {
        (Some(a), Some(b)) => return a.cmp(b),
        _ => {}
    }
    Ordering::Equal
}

fn project_fields(doc: &Value, fields: &[String]) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(id) = doc.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    for field in fields {
        if let Some(v) = doc.get(field) {
            out.insert(field.clone(), v.clone());
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sort_limit_offset_and_project_compose() {
        let docs = vec![
            json!({"id": "a", "age": 30, "name": "Ann"}),
            json!({"id": "b", "age": 20, "name": "Bob"}),
            json!({"id": "c", "age": 40, "name": "Cid"}),
        ];
        let options = QueryOptions {
            limit: Some(1),
            offset: Some(1),
            sort: vec![Sort {
                field: "age".to_string(),
                descending: false,
            }],
            project: vec!["age".to_string()],
        };
        let out = apply_query_options(docs, &options);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], "a");
        assert_eq!(out[0]["age"], 30);
        assert!(out[0].get("name").is_none());
    }
}
