//! The cached datastore.
//!
//! Owns the element cache, the change-id cursors, the derived views, and the
//! upstream feed handle. One receive task drives `keys_changed`; everything
//! it applies is fanned out to the autoupdate loops through the change-tick
//! broadcaster.

pub mod broadcast;
pub mod cache;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use thiserror::Error;

use crate::applause::{Applause, applause_key};
use crate::configview::ConfigView;
use crate::core::{BatchError, ChangeBatch, ChangeId, Key, Shutdown};
use crate::feed::{FeedError, FullData, UpstreamFeed};
use crate::permission::PermissionIndex;
use crate::projector::Projectors;
use crate::required::RequiredUsers;

pub use broadcast::{
    BroadcastError, BroadcasterLimits, ChangeBroadcaster, ChangeNotice, ChangeSubscription, Tick,
};
pub use cache::{Cache, Entry};

/// Default change-id gap above which the datastore resets instead of
/// back-filling.
pub const DEFAULT_GAP_RESET_LIMIT: u64 = 100;

/// The derived views recomputed with every batch, in update order.
pub struct DerivedViews {
    pub config: Arc<ConfigView>,
    pub perms: Arc<PermissionIndex>,
    pub required: Arc<RequiredUsers>,
    pub projectors: Arc<Projectors>,
    pub applause: Arc<Applause>,
}

/// One `keys_changed` outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeysChanged {
    /// A batch (plus any gap fill) was applied.
    Changed {
        keys: Vec<Key>,
        change_id: ChangeId,
        perm_change: bool,
    },
    /// The change-id axis jumped too far; the cache was rebuilt.
    Reset { change_id: ChangeId },
    /// The shutdown signal fired.
    Shutdown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewFailureCounts {
    pub config: u64,
    pub permissions: u64,
    pub required_users: u64,
    pub projectors: u64,
    pub applause: u64,
}

#[derive(Debug, Default)]
struct ViewFailures {
    config: AtomicU64,
    permissions: AtomicU64,
    required_users: AtomicU64,
    projectors: AtomicU64,
    applause: AtomicU64,
}

#[derive(Debug, Default)]
struct Cursors {
    min_id: ChangeId,
    max_id: ChangeId,
}

pub struct Datastore {
    feed: Box<dyn UpstreamFeed>,
    gap_reset_limit: u64,
    cache: Cache,
    cursors: RwLock<Cursors>,
    views: DerivedViews,
    broadcaster: ChangeBroadcaster,
    failures: ViewFailures,
}

struct AppliedBatch {
    keys: Vec<Key>,
    perm_change: bool,
}

impl Datastore {
    /// Bootstrap from a full upstream snapshot.
    pub fn new(
        feed: Box<dyn UpstreamFeed>,
        views: DerivedViews,
        broadcaster_limits: BroadcasterLimits,
        gap_reset_limit: u64,
    ) -> Result<Self, DatastoreError> {
        let datastore = Self {
            feed,
            gap_reset_limit,
            cache: Cache::new(),
            cursors: RwLock::new(Cursors::default()),
            views,
            broadcaster: ChangeBroadcaster::new(broadcaster_limits),
            failures: ViewFailures::default(),
        };
        let full = datastore.feed.full_data()?;
        datastore.install_full(full);
        Ok(datastore)
    }

    /// Lowest change id the upstream can still fill deltas for.
    pub fn lowest_id(&self) -> ChangeId {
        self.cursors.read().expect("cursor lock").min_id
    }

    /// Highest change id fully reflected in the cache.
    pub fn current_id(&self) -> ChangeId {
        self.cursors.read().expect("cursor lock").max_id
    }

    pub fn subscribe(&self) -> Result<ChangeSubscription, BroadcastError> {
        self.broadcaster.subscribe()
    }

    pub fn derived_view_failures(&self) -> ViewFailureCounts {
        ViewFailureCounts {
            config: self.failures.config.load(Ordering::Relaxed),
            permissions: self.failures.permissions.load(Ordering::Relaxed),
            required_users: self.failures.required_users.load(Ordering::Relaxed),
            projectors: self.failures.projectors.load(Ordering::Relaxed),
            applause: self.failures.applause.load(Ordering::Relaxed),
        }
    }

    /// Keys with any change in `(from, to]`, fetched from the upstream.
    ///
    /// Connection loops use this for reconnect catch-up; access to the feed
    /// handle stays serialized through the datastore.
    pub fn changed_keys(&self, from: ChangeId, to: ChangeId) -> Result<Vec<Key>, DatastoreError> {
        Ok(self.feed.changed_keys(from, to)?)
    }

    /// Entries for the given keys; `None` marks deleted or absent keys.
    pub fn entries(&self, keys: &[Key]) -> BTreeMap<Key, Option<Bytes>> {
        keys.iter()
            .map(|key| {
                let value = self.cache.get(key);
                (key.clone(), value)
            })
            .collect()
    }

    /// All live elements together with the change id they reflect.
    pub fn full_view(&self) -> (ChangeId, BTreeMap<Key, Option<Bytes>>) {
        let cursors = self.cursors.read().expect("cursor lock");
        let elements = self
            .cache
            .snapshot()
            .into_iter()
            .filter_map(|(key, entry)| entry.value().cloned().map(|bytes| (key, Some(bytes))))
            .collect();
        (cursors.max_id, elements)
    }

    /// Block until the next batch is applied, the gap forces a reset, or the
    /// service shuts down. Only the receive task calls this.
    pub fn keys_changed(&self, shutdown: &Shutdown) -> Result<KeysChanged, DatastoreError> {
        loop {
            let raw = match self.feed.update(shutdown) {
                Ok(raw) => raw,
                Err(FeedError::Cancelled) => return Ok(KeysChanged::Shutdown),
                Err(err) => return Err(err.into()),
            };
            if raw.is_empty() {
                return Err(FeedError::Protocol("empty update payload".to_string()).into());
            }

            let batch = ChangeBatch::decode(&raw)?;
            let max_id = self.current_id();

            if batch.change_id <= max_id {
                tracing::debug!(
                    change_id = batch.change_id,
                    max_id,
                    "skipping stale change batch"
                );
                continue;
            }

            if batch.change_id > max_id + 1 {
                if batch.change_id > max_id + self.gap_reset_limit {
                    tracing::warn!(
                        change_id = batch.change_id,
                        max_id,
                        "change-id gap too large, resetting from full data"
                    );
                    let change_id = self.reset()?;
                    return Ok(KeysChanged::Reset { change_id });
                }
                return self.fill_gap_and_apply(batch, max_id);
            }

            let applied = self.apply(&batch);
            return Ok(KeysChanged::Changed {
                keys: applied.keys,
                change_id: batch.change_id,
                perm_change: applied.perm_change,
            });
        }
    }

    /// Publish one `keys_changed` outcome to the subscribed loops.
    pub fn notify(&self, outcome: &KeysChanged) {
        match outcome {
            KeysChanged::Changed {
                keys,
                change_id,
                perm_change,
            } => {
                self.broadcaster.publish(ChangeNotice::Changed {
                    change_id: *change_id,
                    keys: keys.clone().into(),
                    perm_change: *perm_change,
                });
            }
            KeysChanged::Reset { change_id } => {
                self.broadcaster.publish(ChangeNotice::Reset {
                    change_id: *change_id,
                });
            }
            KeysChanged::Shutdown => {}
        }
    }

    fn fill_gap_and_apply(
        &self,
        batch: ChangeBatch,
        max_id: ChangeId,
    ) -> Result<KeysChanged, DatastoreError> {
        let fill_keys = self.feed.changed_keys(max_id, batch.change_id - 1)?;
        let mut fill = ChangeBatch::new(batch.change_id - 1);
        if !fill_keys.is_empty() {
            let mut data = self.feed.data(&fill_keys)?;
            for key in fill_keys {
                // A key the upstream no longer knows was deleted in the gap.
                let value = data.remove(&key);
                fill.insert(key, value);
            }
        }

        let fill_applied = self.apply(&fill);
        let applied = self.apply(&batch);

        let mut keys = fill_applied.keys;
        keys.extend(applied.keys);
        keys.sort_unstable();
        keys.dedup();

        Ok(KeysChanged::Changed {
            keys,
            change_id: batch.change_id,
            perm_change: fill_applied.perm_change || applied.perm_change,
        })
    }

    /// Apply one batch and recompute the derived views atomically.
    ///
    /// View failures are logged and counted but never stall the change loop;
    /// the cache and `max_id` advance regardless.
    fn apply(&self, batch: &ChangeBatch) -> AppliedBatch {
        let mut cursors = self.cursors.write().expect("cursor lock");
        self.cache.apply(&batch.elements);
        cursors.max_id = batch.change_id;
        tracing::debug!(change_id = batch.change_id, keys = batch.len(), "applied change batch");

        let mut keys: Vec<Key> = batch.keys().cloned().collect();
        let perm_change = self.views.perms.affects(batch);
        self.update_views(batch, &mut keys);
        drop(cursors);

        keys.sort_unstable();
        keys.dedup();
        AppliedBatch { keys, perm_change }
    }

    fn update_views(&self, batch: &ChangeBatch, keys: &mut Vec<Key>) {
        if self.views.config.affects(batch) {
            if let Err(err) = self.views.config.update(&self.cache) {
                tracing::error!("updating config view: {err}");
                self.failures.config.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.views.perms.affects(batch) {
            if let Err(err) = self.views.perms.update(&self.cache) {
                tracing::error!("updating permission index: {err}");
                self.failures.permissions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.views.required.affects(batch) {
            let out = self.views.required.update(batch, &self.cache);
            if let Some(err) = out.first_err {
                tracing::error!("updating required users: {err}");
                self.failures.required_users.fetch_add(1, Ordering::Relaxed);
            }
            for uid in out.flipped {
                if let Ok(key) = Key::new(crate::permission::USER_COLLECTION, uid) {
                    keys.push(key);
                }
            }
        }

        if self.views.projectors.affects(batch) {
            let out = self.views.projectors.update(batch, &self.cache);
            if let Some(err) = out.first_err {
                tracing::error!("updating projector slides: {err}");
                self.failures.projectors.fetch_add(1, Ordering::Relaxed);
            }
            if !out.changed.is_empty() {
                keys.extend(out.changed.keys().cloned());
                self.cache.apply(&out.changed);
            }
        }

        if self.views.applause.affects(batch) {
            match self.views.applause.update(&self.cache) {
                Ok(Some(emit)) => {
                    let key = applause_key();
                    let mut synthetic = BTreeMap::new();
                    synthetic.insert(key.clone(), emit);
                    self.cache.apply(&synthetic);
                    keys.push(key);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!("updating applause level: {err}");
                    self.failures.applause.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Discard everything and rebuild from a full snapshot.
    fn reset(&self) -> Result<ChangeId, DatastoreError> {
        let full = self.feed.full_data()?;
        let change_id = full.max_change_id;
        self.install_full(full);
        Ok(change_id)
    }

    fn install_full(&self, full: FullData) {
        let mut cursors = self.cursors.write().expect("cursor lock");
        self.cache.clear();
        let elements: BTreeMap<Key, Option<Bytes>> = full
            .elements
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect();
        self.cache.apply(&elements);
        cursors.min_id = full.min_change_id;
        cursors.max_id = full.max_change_id;
        tracing::info!(
            max_id = cursors.max_id,
            min_id = cursors.min_id,
            elements = elements.len(),
            "installed full datastore snapshot"
        );

        if let Err(err) = self.views.config.update(&self.cache) {
            tracing::error!("rebuilding config view: {err}");
            self.failures.config.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(err) = self.views.perms.update(&self.cache) {
            tracing::error!("rebuilding permission index: {err}");
            self.failures.permissions.fetch_add(1, Ordering::Relaxed);
        }
        let required = self.views.required.rebuild(&self.cache);
        if let Some(err) = required.first_err {
            tracing::error!("rebuilding required users: {err}");
            self.failures.required_users.fetch_add(1, Ordering::Relaxed);
        }
        let projectors = self.views.projectors.rebuild(&self.cache);
        if let Some(err) = projectors.first_err {
            tracing::error!("rebuilding projector slides: {err}");
            self.failures.projectors.fetch_add(1, Ordering::Relaxed);
        }
        if !projectors.changed.is_empty() {
            self.cache.apply(&projectors.changed);
        }
        match self.views.applause.update(&self.cache) {
            Ok(Some(emit)) => {
                let mut synthetic = BTreeMap::new();
                synthetic.insert(applause_key(), emit);
                self.cache.apply(&synthetic);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!("rebuilding applause level: {err}");
                self.failures.applause.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("upstream feed: {0}")]
    Feed(#[from] FeedError),
    #[error("malformed upstream batch: {0}")]
    BadBatch(#[from] BatchError),
}

impl DatastoreError {
    /// True if retrying `keys_changed` may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, DatastoreError::Feed(err) if err.is_transient())
    }
}
