//! The log record and the projected document it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminates a [`Event`] as a write or a tombstone.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// Upserts `data` under `id`.
    Put,
    /// Removes `id` and its metadata.
    Delete,
}

/// A single record in the log describing a mutation to one key.
///
/// `oldData` is never produced by writers: it is populated by the projector
/// at projection time, from the value the key held immediately before this
/// event was applied, so that subscriber callbacks can see the pre-image of
/// a delete.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Whether this is a write or a tombstone.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The user-chosen key this event mutates.
    pub id: String,
    /// The payload to upsert. Present for `Put`, absent for `Delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The value `id` held just before this event was projected, or `null`
    /// if the key was not live. Populated by the projector; never sent over
    /// the wire by writers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<Value>,
    /// Producer wall-clock time, milliseconds since epoch.
    pub timestamp: i64,
}

impl Event {
    /// Builds a `PUT` event for `id` stamped with the current wall-clock time.
    pub fn put(id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: EventKind::Put,
            id: id.into(),
            data: Some(data),
            old_data: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Builds a `DELETE` event for `id` stamped with the current wall-clock time.
    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            id: id.into(),
            data: None,
            old_data: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Serializes the wire form of this event (without `old_data`, which is
    /// a projector-only annotation never meant to reach the log).
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(rename = "type")]
            kind: EventKind,
            id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            data: &'a Option<Value>,
            timestamp: i64,
        }
        serde_json::to_vec(&Wire {
            kind: self.kind,
            id: &self.id,
            data: &self.data,
            timestamp: self.timestamp,
        })
    }

    /// Parses an event from wire bytes. `old_data` always starts `None`;
    /// the projector fills it in before notifying subscribers.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Per-key metadata tracked alongside every live document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetaData {
    /// ISO-8601 timestamp of the first PUT that produced this key in the
    /// current lineage (i.e. since the last DELETE, if any).
    pub date_created: String,
    /// ISO-8601 timestamp of the most recently applied PUT.
    pub date_modified: String,
    /// Count of PUTs applied to this key since its current lineage began.
    pub changes: u64,
}

impl MetaData {
    /// Starts a fresh lineage for a key whose first PUT landed at `time_ms`.
    pub fn new_lineage(time_ms: i64) -> Self {
        let iso = ms_to_iso(time_ms);
        Self {
            date_created: iso.clone(),
            date_modified: iso,
            changes: 1,
        }
    }

    /// Records a subsequent PUT within the same lineage.
    pub fn record_put(&mut self, time_ms: i64) {
        self.date_modified = ms_to_iso(time_ms);
        self.changes += 1;
    }
}

/// Converts milliseconds-since-epoch to an ISO-8601 string.
pub fn ms_to_iso(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// The materialized value of one live key: its metadata and its payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Per-key metadata.
    pub meta: MetaData,
    /// The document, as last written by a PUT.
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_roundtrip_drops_old_data() {
        let mut ev = Event::put("user1", json!({"name": "John"}));
        ev.old_data = Some(json!({"name": "previous"}));

        let bytes = ev.to_wire_bytes().unwrap();
        let parsed = Event::from_wire_bytes(&bytes).unwrap();

        assert_eq!(parsed.id, "user1");
        assert_eq!(parsed.kind, EventKind::Put);
        assert_eq!(parsed.data, Some(json!({"name": "John"})));
        assert_eq!(parsed.old_data, None);
    }

    #[test]
    fn delete_event_has_no_data() {
        let ev = Event::delete("user1");
        let bytes = ev.to_wire_bytes().unwrap();
        let parsed = Event::from_wire_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind, EventKind::Delete);
        assert_eq!(parsed.data, None);
    }

    #[test]
    fn metadata_tracks_lineage() {
        let mut meta = MetaData::new_lineage(1_000);
        assert_eq!(meta.changes, 1);
        assert_eq!(meta.date_created, meta.date_modified);

        meta.record_put(2_000);
        assert_eq!(meta.changes, 2);
        assert_ne!(meta.date_created, meta.date_modified);
    }
}
