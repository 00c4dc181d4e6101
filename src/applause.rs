//! Applause level derivation.
//!
//! Users signalling applause create `users/applause` records; the level is
//! reported against the number of present active users. The result is
//! exposed as the synthetic element `applause:1` when the feature is
//! enabled in config.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::configview::{APPLAUSE_ENABLED_KEY, CONFIG_COLLECTION, ConfigView};
use crate::core::{ChangeBatch, Key};
use crate::datastore::Cache;
use crate::permission::USER_COLLECTION;

/// Collection of the applause signal records.
pub const APPLAUSE_COLLECTION: &str = "users/applause";

/// Synthetic collection under which the derived level is exposed.
pub const APPLAUSE_SYNTHETIC_COLLECTION: &str = "applause";

/// Synthetic key of the derived level element.
pub fn applause_key() -> Key {
    Key::new(APPLAUSE_SYNTHETIC_COLLECTION, 1).expect("static key")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplauseLevel {
    pub level: u64,
    pub present_users: u64,
}

pub struct Applause {
    config: Arc<ConfigView>,
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    enabled: bool,
    level: ApplauseLevel,
}

impl Applause {
    pub fn new(config: Arc<ConfigView>) -> Self {
        Self {
            config,
            inner: RwLock::new(State::default()),
        }
    }

    pub fn level(&self) -> Option<ApplauseLevel> {
        let inner = self.inner.read().expect("applause lock");
        inner.enabled.then_some(inner.level)
    }

    pub fn affects(&self, batch: &ChangeBatch) -> bool {
        batch.touches(APPLAUSE_COLLECTION)
            || batch.touches(USER_COLLECTION)
            || batch.touches(CONFIG_COLLECTION)
    }

    /// Recompute from the cache. Returns the new synthetic element when it
    /// changed: `Some(Some(_))` publishes a level, `Some(None)` retires the
    /// element (feature switched off), `None` means nothing to emit.
    pub fn update(&self, cache: &Cache) -> Result<Option<Option<Bytes>>, ApplauseError> {
        #[derive(Deserialize)]
        struct UserElement {
            #[serde(default = "default_true")]
            is_active: bool,
            #[serde(default)]
            is_present: bool,
        }

        fn default_true() -> bool {
            true
        }

        let enabled: bool = self.config.get_or(APPLAUSE_ENABLED_KEY, false);

        let mut first_err = None;
        let mut present_users = 0u64;
        if enabled {
            for (key, raw) in cache.collection(USER_COLLECTION) {
                match serde_json::from_slice::<UserElement>(&raw) {
                    Ok(user) if user.is_active && user.is_present => present_users += 1,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("undecodable user {key}: {err}");
                        first_err.get_or_insert(ApplauseError::BadElement {
                            key: key.to_string(),
                            source: err,
                        });
                    }
                }
            }
        }

        let level = ApplauseLevel {
            level: cache.collection(APPLAUSE_COLLECTION).len() as u64,
            present_users,
        };

        let mut inner = self.inner.write().expect("applause lock");
        let was = (inner.enabled, inner.level);
        inner.enabled = enabled;
        inner.level = level;

        let emit = if !enabled {
            // Retire the element once when the feature goes away.
            was.0.then_some(None)
        } else if was != (true, level) {
            let payload = json!({
                "level": level.level,
                "present_users": level.present_users,
            });
            let bytes =
                serde_json::to_vec(&payload).map_err(|source| ApplauseError::Encode { source })?;
            Some(Some(Bytes::from(bytes)))
        } else {
            None
        };

        if let Some(err) = first_err {
            return Err(err);
        }
        Ok(emit)
    }
}

#[derive(Debug, Error)]
pub enum ApplauseError {
    #[error("undecodable element {key}")]
    BadElement {
        key: String,
        source: serde_json::Error,
    },
    #[error("encoding applause level")]
    Encode { source: serde_json::Error },
}
