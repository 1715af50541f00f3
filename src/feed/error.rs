//! Error types for page fetching.

use thiserror::Error;

use crate::store::StoreError;

/// Errors a feed source can surface to the pagination controller.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The platform signalled the caller may not view this resource.
    /// Terminal for the owning feed; the projected list is cleared.
    #[error("Access to the feed was denied")]
    PermissionDenied,

    /// Anything recoverable: network, rate limit, auth hiccup, store
    /// trouble. The controller retries these after a fixed delay.
    #[error("Transient fetch failure: {0}")]
    Transient(#[from] anyhow::Error),
}

impl From<StoreError> for FetchError {
    fn from(error: StoreError) -> Self {
        Self::Transient(error.into())
    }
}
