#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **toka-kv-types** – Core abstractions for Toka KV.
//!
//! This crate defines the data model (events, metadata, records), the
//! storage-backend and log-client traits that concrete drivers implement,
//! and the predicate evaluator shared by queries and subscriptions. It sits
//! at the core layer and performs no I/O itself.

pub mod error;
pub mod event;
pub mod log;
pub mod predicate;
pub mod stats;
pub mod store;
pub mod subject;

pub use error::KvError;
pub use event::{Event, EventKind, MetaData, Record};
pub use log::{LogClient, LogMessage};
pub use predicate::{Condition, Predicate};
pub use stats::{Operation as StatsOperation, StatsEvent};
pub use store::{LocalStore, QueryOptions, Sort};
pub use subject::SubjectCodec;

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        error::KvError,
        event::{Event, EventKind, MetaData, Record},
        log::{LogClient, LogMessage},
        predicate::{Condition, Predicate},
        stats::{Operation as StatsOperation, StatsEvent},
        store::{LocalStore, QueryOptions, Sort},
        subject::SubjectCodec,
    };
}
