//! timeline-sync — reconciliation and pagination core for a multi-platform
//! (Twitter/Mastodon) social client.
//!
//! Network clients hand this crate paginated, partially-overlapping batches
//! of typed remote entities plus the timestamp the response was received.
//! The crate folds them into a consistent local SQLite graph (idempotent
//! create-or-merge with a monotonic timestamp guard), decides whether older
//! timeline history still exists upstream, and republishes ordered,
//! debounced record sequences for list screens driven by a strict
//! pagination state machine.

#![warn(clippy::all)]

pub mod config;
pub mod feed;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod timeline;

pub use config::SyncConfig;
pub use feed::pagination::{FeedController, FeedSink, FeedSource, FeedState, LoadedPage, PageToken};
pub use feed::projector::{ProjectionFilter, RecordProjector};
pub use feed::FetchError;
pub use reconcile::{PersistResult, Reconciler};
pub use remote::RemoteEntity;
pub use store::{SqliteStore, Store};
pub use timeline::{PageFetcher, RemotePage, TimelineSource};
