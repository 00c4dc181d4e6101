//! "Required users" derivation.
//!
//! A user must stay visible to a viewer while any visible record references
//! them (speaker, submitter, candidate, ...). Per registered collection a
//! callable extracts the referenced user ids; the view refcounts
//! (uid, cause) pairs so that deleting or rewriting one source record
//! decrements exactly what that record contributed.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use crate::core::{ChangeBatch, Key, UserId};
use crate::datastore::Cache;

/// Extracts the user ids a record requires.
pub type ExtractFn = fn(&[u8]) -> Result<HashSet<UserId>, serde_json::Error>;

/// One registered source collection.
#[derive(Clone, Copy)]
pub struct RequiredCallable {
    /// Provenance tag, e.g. `"speaker"`.
    pub cause: &'static str,
    pub extract: ExtractFn,
}

/// Result of feeding one batch through the view.
#[derive(Debug, Default)]
pub struct RequiredUpdate {
    /// Uids whose required-status flipped in either direction.
    pub flipped: Vec<UserId>,
    /// First decode failure, if any. The rest of the batch is still applied.
    pub first_err: Option<RequiredError>,
}

#[derive(Default)]
struct Inner {
    /// Last uid set contributed per source key.
    sources: HashMap<Key, HashSet<UserId>>,
    /// Live (uid, cause) refcounts.
    counts: HashMap<UserId, HashMap<&'static str, usize>>,
}

pub struct RequiredUsers {
    registry: HashMap<&'static str, RequiredCallable>,
    inner: RwLock<Inner>,
}

impl RequiredUsers {
    pub fn new(registry: HashMap<&'static str, RequiredCallable>) -> Self {
        Self {
            registry,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// True if at least one live cause references the uid.
    pub fn is_required(&self, uid: UserId) -> bool {
        let inner = self.inner.read().expect("required lock");
        inner
            .counts
            .get(&uid)
            .is_some_and(|causes| causes.values().any(|count| *count > 0))
    }

    /// The causes currently holding a uid, for diagnostics.
    pub fn causes(&self, uid: UserId) -> Vec<&'static str> {
        let inner = self.inner.read().expect("required lock");
        let mut causes: Vec<&'static str> = inner
            .counts
            .get(&uid)
            .map(|causes| {
                causes
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(cause, _)| *cause)
                    .collect()
            })
            .unwrap_or_default();
        causes.sort_unstable();
        causes
    }

    pub fn affects(&self, batch: &ChangeBatch) -> bool {
        batch
            .keys()
            .any(|key| self.registry.contains_key(key.collection()))
    }

    /// Apply one batch. The cache has already been updated.
    pub fn update(&self, batch: &ChangeBatch, cache: &Cache) -> RequiredUpdate {
        let mut out = RequiredUpdate::default();
        let mut inner = self.inner.write().expect("required lock");

        for key in batch.keys() {
            let Some(callable) = self.registry.get(key.collection()) else {
                continue;
            };

            let new_uids = match cache.get(key) {
                Some(raw) => match (callable.extract)(&raw) {
                    Ok(uids) => uids,
                    Err(err) => {
                        tracing::warn!("required-users extract failed for {key}: {err}");
                        out.first_err.get_or_insert(RequiredError::BadElement {
                            key: key.to_string(),
                            source: err,
                        });
                        // A bad record contributes nothing; its old
                        // contribution is still withdrawn below.
                        HashSet::new()
                    }
                },
                None => HashSet::new(),
            };

            let old_uids = inner.sources.remove(key).unwrap_or_default();
            for uid in old_uids.difference(&new_uids) {
                if inner.decrement(*uid, callable.cause) {
                    out.flipped.push(*uid);
                }
            }
            for uid in new_uids.difference(&old_uids) {
                if inner.increment(*uid, callable.cause) {
                    out.flipped.push(*uid);
                }
            }

            if !new_uids.is_empty() {
                inner.sources.insert(key.clone(), new_uids);
            }
        }

        out.flipped.sort_unstable();
        out.flipped.dedup();
        out
    }

    /// Recompute everything from the cache. Used by reset.
    pub fn rebuild(&self, cache: &Cache) -> RequiredUpdate {
        {
            let mut inner = self.inner.write().expect("required lock");
            *inner = Inner::default();
        }

        let mut synthetic = ChangeBatch::new(0);
        for collection in self.registry.keys() {
            for (key, _) in cache.collection(collection) {
                synthetic.insert(key, None);
            }
        }
        self.update(&synthetic, cache)
    }
}

impl Inner {
    /// Returns true if the uid became required.
    fn increment(&mut self, uid: UserId, cause: &'static str) -> bool {
        let causes = self.counts.entry(uid).or_default();
        let was_required = causes.values().any(|count| *count > 0);
        *causes.entry(cause).or_insert(0) += 1;
        !was_required
    }

    /// Returns true if the uid stopped being required.
    fn decrement(&mut self, uid: UserId, cause: &'static str) -> bool {
        let Some(causes) = self.counts.get_mut(&uid) else {
            return false;
        };
        if let Some(count) = causes.get_mut(cause) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                causes.remove(cause);
            }
        }
        let still_required = causes.values().any(|count| *count > 0);
        if causes.is_empty() {
            self.counts.remove(&uid);
        }
        !still_required
    }
}

#[derive(Debug, Error)]
pub enum RequiredError {
    #[error("undecodable element {key}")]
    BadElement {
        key: String,
        source: serde_json::Error,
    },
}
