//! Permission-driven element filtering.
//!
//! A registry maps collection names to element functions. For a given viewer
//! an element either passes unchanged, passes rewritten (fields dropped), or
//! is hidden. Collections without a registered function are private and only
//! admins see them.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{Key, UserId};
use crate::permission::PermissionIndex;

/// Outcome of one element function call.
pub enum Restricted {
    Unchanged,
    Rewritten(Bytes),
    Hidden,
}

/// Per-collection filter. Must be pure with respect to the permission and
/// cache snapshots of one change id.
pub type ElementFunc = Box<dyn Fn(UserId, &[u8]) -> Result<Restricted, RestrictError> + Send + Sync>;

pub struct Restricter {
    registry: HashMap<&'static str, ElementFunc>,
    perms: Arc<PermissionIndex>,
}

impl Restricter {
    pub fn new(registry: HashMap<&'static str, ElementFunc>, perms: Arc<PermissionIndex>) -> Self {
        Self { registry, perms }
    }

    /// Restrict a set of elements for one viewer.
    ///
    /// Input `None` values are upstream deletions and pass through; output
    /// `None` values mean "not visible to this viewer" (deleted or hidden).
    /// Any element-function error aborts the whole request; the caller falls
    /// back to a full snapshot.
    pub fn restrict(
        &self,
        uid: UserId,
        elements: &BTreeMap<Key, Option<Bytes>>,
    ) -> Result<BTreeMap<Key, Option<Bytes>>, RestrictError> {
        let admin = self.perms.is_admin(uid);
        let mut out = BTreeMap::new();
        for (key, value) in elements {
            let restricted = match value {
                None => None,
                Some(bytes) => self.restrict_element(uid, admin, key, bytes)?,
            };
            out.insert(key.clone(), restricted);
        }
        Ok(out)
    }

    fn restrict_element(
        &self,
        uid: UserId,
        admin: bool,
        key: &Key,
        bytes: &Bytes,
    ) -> Result<Option<Bytes>, RestrictError> {
        let Some(func) = self.registry.get(key.collection()) else {
            // Unregistered collections are private.
            if admin {
                return Ok(Some(bytes.clone()));
            }
            return Ok(None);
        };

        match func(uid, bytes)? {
            Restricted::Unchanged => Ok(Some(bytes.clone())),
            Restricted::Rewritten(rewritten) => Ok(Some(rewritten)),
            Restricted::Hidden => Ok(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum RestrictError {
    #[error("decoding {collection} element: {source}")]
    Decode {
        collection: &'static str,
        source: serde_json::Error,
    },
    #[error("encoding {collection} element: {source}")]
    Encode {
        collection: &'static str,
        source: serde_json::Error,
    },
}
