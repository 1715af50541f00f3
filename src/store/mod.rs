//! Local persistent graph of reconciled records.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStore, Store};
pub use error::StoreError;
pub use types::{
    ListPayload, LocalRecord, NotificationPayload, Payload, PollOptionPayload, RecordKey,
    RecordKind, StatusPayload, StoreSummary, TimelineKind, UserPayload,
};
