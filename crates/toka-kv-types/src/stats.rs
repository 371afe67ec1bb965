//! The telemetry event schema emitted by [`crate::store::LocalStore`]-backed
//! operations. Publishing is best-effort and entirely optional; this module
//! only defines the wire schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operation a [`StatsEvent`] reports on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// `Base::get`.
    Get,
    /// `Base::query` or `Base::count`.
    Query,
    /// `Base::put` or `Base::insert`.
    Put,
    /// `Base::delete`.
    Delete,
    /// `Base::keys`.
    Keys,
    /// `Base::subscribe`.
    Subscribe,
    /// A subscription callback firing.
    SubscribeEmit,
}

/// One best-effort telemetry record, published to `<statsStream>.stats` when
/// stats publishing is configured.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsEvent {
    /// Which public operation this record describes.
    pub operation: Operation,
    /// The key the operation addressed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The `keys()` pattern, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// The query object passed to `query`/`count`/`subscribe`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    /// The number of documents a query-shaped operation matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_result_count: Option<usize>,
    /// Milliseconds since epoch when the operation was recorded.
    pub timestamp: i64,
    /// Wall-clock duration of the operation, in milliseconds.
    pub duration: i64,
}
