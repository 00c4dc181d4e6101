//! Typed view over `core/config` records.
//!
//! Config elements look like `{"id": 3, "key": "motions_export_title",
//! "value": ...}`. The view keeps a name -> value index and decodes on
//! access; unknown keys are absent, not errors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::core::ChangeBatch;
use crate::datastore::Cache;

pub const CONFIG_COLLECTION: &str = "core/config";

/// Config key gating the anonymous user.
pub const ANONYMOUS_ENABLED_KEY: &str = "general_system_enable_anonymous";

/// Config key gating the applause feature.
pub const APPLAUSE_ENABLED_KEY: &str = "general_system_applause_enable";

#[derive(Debug, Default)]
pub struct ConfigView {
    inner: RwLock<Arc<HashMap<String, Value>>>,
}

impl ConfigView {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the batch can change any config value.
    pub fn affects(&self, batch: &ChangeBatch) -> bool {
        batch.touches(CONFIG_COLLECTION)
    }

    /// Rebuild the name index from the cache.
    pub fn update(&self, cache: &Cache) -> Result<(), ConfigError> {
        #[derive(Deserialize)]
        struct ConfigElement {
            key: String,
            #[serde(default)]
            value: Value,
        }

        let mut index = HashMap::new();
        let mut first_err = None;
        for (key, raw) in cache.collection(CONFIG_COLLECTION) {
            match serde_json::from_slice::<ConfigElement>(&raw) {
                Ok(element) => {
                    index.insert(element.key, element.value);
                }
                Err(err) => {
                    tracing::warn!("undecodable config element {key}: {err}");
                    first_err.get_or_insert(ConfigError::BadElement {
                        key: key.to_string(),
                        source: err,
                    });
                }
            }
        }

        *self.inner.write().expect("config lock") = Arc::new(index);
        first_err.map_or(Ok(()), Err)
    }

    /// Decoded value for `name`; absent keys and decode failures are `None`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let index = self.inner.read().expect("config lock").clone();
        let value = index.get(name)?;
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                tracing::warn!("config value {name} has unexpected shape: {err}");
                None
            }
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.get(name).unwrap_or(default)
    }

    pub fn anonymous_enabled(&self) -> bool {
        self.get_or(ANONYMOUS_ENABLED_KEY, false)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("undecodable config element {key}")]
    BadElement {
        key: String,
        source: serde_json::Error,
    },
}
