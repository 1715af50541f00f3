//! Feed control plane: pagination state machine and record projection.

pub mod error;
pub mod pagination;
pub mod projector;

pub use error::FetchError;
pub use pagination::{FeedController, FeedSink, FeedSource, FeedState, LoadedPage, PageToken};
pub use projector::{ProjectionFilter, RecordProjector};
