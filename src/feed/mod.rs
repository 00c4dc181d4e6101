//! Upstream change feed.
//!
//! The datastore talks to the platform through this trait. One concrete
//! transport ships (`socket`, newline-delimited JSON); tests drive the
//! in-memory scripted feed instead.

pub mod socket;

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{ChangeId, Key, Shutdown};

pub use socket::SocketFeed;

/// Full snapshot of the upstream graph plus the change-id window.
#[derive(Clone, Debug, Default)]
pub struct FullData {
    pub elements: BTreeMap<Key, Bytes>,
    pub max_change_id: ChangeId,
    pub min_change_id: ChangeId,
}

/// Source of change batches.
///
/// `update` blocks until the next batch or until the shutdown signal fires.
/// The other calls are plain RPCs; the datastore serializes access, so
/// implementations only need interior mutability, not internal locking
/// discipline beyond that.
pub trait UpstreamFeed: Send + Sync {
    /// Full snapshot and the current `(min, max)` change-id window.
    fn full_data(&self) -> Result<FullData, FeedError>;

    /// Block until the next raw batch.
    ///
    /// The payload decodes as `{"elements": {...}, "change_id": n}`. An empty
    /// payload on a non-cancelled return is a protocol violation and must be
    /// reported as such, never returned.
    fn update(&self, shutdown: &Shutdown) -> Result<Bytes, FeedError>;

    /// Keys with any change in `(from, to]`.
    fn changed_keys(&self, from: ChangeId, to: ChangeId) -> Result<Vec<Key>, FeedError>;

    /// Current value per key.
    fn data(&self, keys: &[Key]) -> Result<BTreeMap<Key, Bytes>, FeedError>;
}

impl<T: UpstreamFeed + ?Sized> UpstreamFeed for std::sync::Arc<T> {
    fn full_data(&self) -> Result<FullData, FeedError> {
        (**self).full_data()
    }

    fn update(&self, shutdown: &Shutdown) -> Result<Bytes, FeedError> {
        (**self).update(shutdown)
    }

    fn changed_keys(&self, from: ChangeId, to: ChangeId) -> Result<Vec<Key>, FeedError> {
        (**self).changed_keys(from, to)
    }

    fn data(&self, keys: &[Key]) -> Result<BTreeMap<Key, Bytes>, FeedError> {
        (**self).data(keys)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// The shutdown signal fired while blocking.
    #[error("cancelled")]
    Cancelled,
    /// Transport failure; retrying may succeed.
    #[error("upstream io: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed frame; the feed connection is unusable.
    #[error("upstream protocol violation: {0}")]
    Protocol(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Io(_))
    }
}
