//! Per-user permission index.
//!
//! Derives, for every user id, the set of granted permission strings from
//! the current `users/user` and `users/group` records. Reads are lock-free
//! on an immutable snapshot; the index is rebuilt whenever a batch touches
//! users, groups, or config.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use thiserror::Error;

use crate::configview::{CONFIG_COLLECTION, ConfigView};
use crate::core::{ChangeBatch, UserId};
use crate::datastore::Cache;

pub const USER_COLLECTION: &str = "users/user";
pub const GROUP_COLLECTION: &str = "users/group";

/// Group ids with special meaning, from service config.
#[derive(Clone, Copy, Debug)]
pub struct GroupIds {
    /// Applies to every user, including the anonymous one.
    pub default_group: u64,
    /// Membership grants every permission.
    pub admin_group: u64,
}

impl Default for GroupIds {
    fn default() -> Self {
        Self {
            default_group: 1,
            admin_group: 2,
        }
    }
}

#[derive(Debug, Default)]
struct UserPerms {
    admin: bool,
    perms: HashSet<String>,
}

/// Immutable result of one rebuild.
#[derive(Debug, Default)]
pub struct PermSnapshot {
    anonymous_enabled: bool,
    default_perms: HashSet<String>,
    users: HashMap<UserId, UserPerms>,
}

impl PermSnapshot {
    pub fn has_perm(&self, uid: UserId, perm: &str) -> bool {
        if uid == 0 {
            return self.anonymous_enabled && self.default_perms.contains(perm);
        }
        match self.users.get(&uid) {
            Some(user) => user.admin || user.perms.contains(perm),
            None => false,
        }
    }

    pub fn is_admin(&self, uid: UserId) -> bool {
        self.users.get(&uid).is_some_and(|user| user.admin)
    }

    pub fn anonymous_enabled(&self) -> bool {
        self.anonymous_enabled
    }

    /// True if the uid names a live, connectable user.
    pub fn knows_user(&self, uid: UserId) -> bool {
        if uid == 0 {
            return self.anonymous_enabled;
        }
        self.users.contains_key(&uid)
    }
}

pub struct PermissionIndex {
    groups: GroupIds,
    config: Arc<ConfigView>,
    snapshot: RwLock<Arc<PermSnapshot>>,
}

impl PermissionIndex {
    pub fn new(groups: GroupIds, config: Arc<ConfigView>) -> Self {
        Self {
            groups,
            config,
            snapshot: RwLock::new(Arc::new(PermSnapshot::default())),
        }
    }

    /// Current snapshot pointer. Never blocks a rebuild.
    pub fn snapshot(&self) -> Arc<PermSnapshot> {
        self.snapshot.read().expect("permission lock").clone()
    }

    pub fn has_perm(&self, uid: UserId, perm: &str) -> bool {
        self.snapshot().has_perm(uid, perm)
    }

    pub fn is_admin(&self, uid: UserId) -> bool {
        self.snapshot().is_admin(uid)
    }

    /// True if the batch can change any user's permission set.
    pub fn affects(&self, batch: &ChangeBatch) -> bool {
        batch.touches(USER_COLLECTION)
            || batch.touches(GROUP_COLLECTION)
            || batch.touches(CONFIG_COLLECTION)
    }

    /// Rebuild the snapshot from the cache.
    pub fn update(&self, cache: &Cache) -> Result<(), PermError> {
        #[derive(Deserialize)]
        struct GroupElement {
            id: u64,
            #[serde(default)]
            permissions: Vec<String>,
        }

        #[derive(Deserialize)]
        struct UserElement {
            id: u64,
            #[serde(default)]
            groups_id: Vec<u64>,
            #[serde(default = "default_true")]
            is_active: bool,
            #[serde(default)]
            is_superadmin: bool,
        }

        fn default_true() -> bool {
            true
        }

        let mut first_err = None;

        let mut group_perms: HashMap<u64, HashSet<String>> = HashMap::new();
        for (key, raw) in cache.collection(GROUP_COLLECTION) {
            match serde_json::from_slice::<GroupElement>(&raw) {
                Ok(group) => {
                    group_perms.insert(group.id, group.permissions.into_iter().collect());
                }
                Err(err) => {
                    tracing::warn!("undecodable group {key}: {err}");
                    first_err.get_or_insert(PermError::BadElement {
                        key: key.to_string(),
                        source: err,
                    });
                }
            }
        }

        let default_perms = group_perms
            .get(&self.groups.default_group)
            .cloned()
            .unwrap_or_default();

        let mut users = HashMap::new();
        for (key, raw) in cache.collection(USER_COLLECTION) {
            let user = match serde_json::from_slice::<UserElement>(&raw) {
                Ok(user) => user,
                Err(err) => {
                    tracing::warn!("undecodable user {key}: {err}");
                    first_err.get_or_insert(PermError::BadElement {
                        key: key.to_string(),
                        source: err,
                    });
                    continue;
                }
            };

            let entry = if !user.is_active {
                // Inactive users keep only the default-group rights.
                UserPerms {
                    admin: false,
                    perms: default_perms.clone(),
                }
            } else {
                let admin = user.is_superadmin
                    || user.groups_id.contains(&self.groups.admin_group);
                let mut perms = default_perms.clone();
                for group_id in &user.groups_id {
                    if let Some(group) = group_perms.get(group_id) {
                        perms.extend(group.iter().cloned());
                    }
                }
                UserPerms { admin, perms }
            };
            users.insert(user.id, entry);
        }

        let snapshot = PermSnapshot {
            anonymous_enabled: self.config.anonymous_enabled(),
            default_perms,
            users,
        };
        *self.snapshot.write().expect("permission lock") = Arc::new(snapshot);

        first_err.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Error)]
pub enum PermError {
    #[error("undecodable element {key}")]
    BadElement {
        key: String,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    use crate::core::Key;

    fn cache_with(elements: &[(&str, &str)]) -> Cache {
        let cache = Cache::new();
        let batch: BTreeMap<Key, Option<Bytes>> = elements
            .iter()
            .map(|(k, v)| {
                (
                    Key::parse(k).unwrap(),
                    Some(Bytes::copy_from_slice(v.as_bytes())),
                )
            })
            .collect();
        cache.apply(&batch);
        cache
    }

    fn index_over(cache: &Cache) -> PermissionIndex {
        let config = Arc::new(ConfigView::new());
        config.update(cache).unwrap();
        let index = PermissionIndex::new(GroupIds::default(), config);
        index.update(cache).unwrap();
        index
    }

    const GROUPS: &[(&str, &str)] = &[
        (
            "users/group:1",
            r#"{"id":1,"permissions":["agenda.can_see"]}"#,
        ),
        ("users/group:2", r#"{"id":2,"permissions":[]}"#),
        (
            "users/group:3",
            r#"{"id":3,"permissions":["agenda.can_manage","agenda.can_see_internal_items"]}"#,
        ),
    ];

    #[test]
    fn union_of_group_permissions() {
        let mut elements = GROUPS.to_vec();
        elements.push(("users/user:5", r#"{"id":5,"groups_id":[3]}"#));
        let cache = cache_with(&elements);
        let index = index_over(&cache);

        assert!(index.has_perm(5, "agenda.can_see"));
        assert!(index.has_perm(5, "agenda.can_manage"));
        assert!(!index.has_perm(5, "motions.can_manage"));
        assert!(!index.is_admin(5));
    }

    #[test]
    fn admin_group_grants_everything() {
        let mut elements = GROUPS.to_vec();
        elements.push(("users/user:9", r#"{"id":9,"groups_id":[2]}"#));
        let cache = cache_with(&elements);
        let index = index_over(&cache);

        assert!(index.is_admin(9));
        assert!(index.has_perm(9, "anything.at_all"));
    }

    #[test]
    fn superadmin_flag_grants_everything() {
        let mut elements = GROUPS.to_vec();
        elements.push((
            "users/user:4",
            r#"{"id":4,"groups_id":[],"is_superadmin":true}"#,
        ));
        let cache = cache_with(&elements);
        let index = index_over(&cache);
        assert!(index.is_admin(4));
    }

    #[test]
    fn anonymous_needs_config_switch() {
        let cache = cache_with(GROUPS);
        let index = index_over(&cache);
        assert!(!index.has_perm(0, "agenda.can_see"));

        let mut elements = GROUPS.to_vec();
        elements.push((
            "core/config:1",
            r#"{"id":1,"key":"general_system_enable_anonymous","value":true}"#,
        ));
        let cache = cache_with(&elements);
        let index = index_over(&cache);
        assert!(index.has_perm(0, "agenda.can_see"));
        assert!(!index.has_perm(0, "agenda.can_manage"));
    }

    #[test]
    fn inactive_user_falls_back_to_default_group() {
        let mut elements = GROUPS.to_vec();
        elements.push((
            "users/user:7",
            r#"{"id":7,"groups_id":[2,3],"is_active":false}"#,
        ));
        let cache = cache_with(&elements);
        let index = index_over(&cache);

        assert!(index.has_perm(7, "agenda.can_see"));
        assert!(!index.has_perm(7, "agenda.can_manage"));
        assert!(!index.is_admin(7));
    }

    #[test]
    fn unknown_user_has_no_permissions() {
        let cache = cache_with(GROUPS);
        let index = index_over(&cache);
        assert!(!index.has_perm(99, "agenda.can_see"));
        assert!(!index.snapshot().knows_user(99));
    }

    #[test]
    fn affects_user_group_and_config_batches() {
        let cache = cache_with(GROUPS);
        let index = index_over(&cache);
        for raw in [
            br#"{"elements":{"users/user:1":{}},"change_id":1}"#.as_ref(),
            br#"{"elements":{"users/group:1":{}},"change_id":1}"#.as_ref(),
            br#"{"elements":{"core/config:1":{}},"change_id":1}"#.as_ref(),
        ] {
            assert!(index.affects(&ChangeBatch::decode(raw).unwrap()));
        }
        let other =
            ChangeBatch::decode(br#"{"elements":{"motions/motion:1":{}},"change_id":1}"#).unwrap();
        assert!(!index.affects(&other));
    }
}
