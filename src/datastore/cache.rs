//! Concurrent key/value mirror.
//!
//! Values are opaque JSON bytes. Deletions are kept as tombstones so the
//! autoupdate loops can tell "deleted" from "never existed".

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use bytes::Bytes;

use crate::core::Key;

/// One cache slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    Value(Bytes),
    Tombstone,
}

impl Entry {
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Entry::Value(bytes) => Some(bytes),
            Entry::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Entry::Tombstone)
    }
}

/// Single-writer, many-reader element cache.
///
/// `apply` installs a whole batch under the write lock; readers see the
/// pre-batch or post-batch state, never a torn batch.
#[derive(Debug, Default)]
pub struct Cache {
    inner: RwLock<HashMap<Key, Entry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value. Tombstoned and absent keys both read as `None`.
    pub fn get(&self, key: &Key) -> Option<Bytes> {
        let inner = self.inner.read().expect("cache lock");
        inner.get(key).and_then(|entry| entry.value().cloned())
    }

    /// The slot itself, distinguishing tombstone from absent.
    pub fn entry(&self, key: &Key) -> Option<Entry> {
        let inner = self.inner.read().expect("cache lock");
        inner.get(key).cloned()
    }

    /// Values for the given keys; absent and tombstoned keys are omitted.
    pub fn get_many(&self, keys: &[Key]) -> BTreeMap<Key, Bytes> {
        let inner = self.inner.read().expect("cache lock");
        keys.iter()
            .filter_map(|key| {
                inner
                    .get(key)
                    .and_then(Entry::value)
                    .map(|bytes| (key.clone(), bytes.clone()))
            })
            .collect()
    }

    /// Consistent point-in-time view of every slot, tombstones included.
    pub fn snapshot(&self) -> HashMap<Key, Entry> {
        self.inner.read().expect("cache lock").clone()
    }

    /// All live values of one collection.
    pub fn collection(&self, collection: &str) -> Vec<(Key, Bytes)> {
        let inner = self.inner.read().expect("cache lock");
        let mut out: Vec<(Key, Bytes)> = inner
            .iter()
            .filter(|(key, _)| key.collection() == collection)
            .filter_map(|(key, entry)| entry.value().map(|bytes| (key.clone(), bytes.clone())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Install a batch atomically. `None` values become tombstones.
    pub fn apply(&self, elements: &BTreeMap<Key, Option<Bytes>>) {
        let mut inner = self.inner.write().expect("cache lock");
        for (key, value) in elements {
            let entry = match value {
                Some(bytes) => Entry::Value(bytes.clone()),
                None => Entry::Tombstone,
            };
            inner.insert(key.clone(), entry);
        }
    }

    /// Drop everything, including tombstones. Used by reset.
    pub fn clear(&self) {
        self.inner.write().expect("cache lock").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("cache lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    fn batch(entries: &[(&str, Option<&str>)]) -> BTreeMap<Key, Option<Bytes>> {
        entries
            .iter()
            .map(|(k, v)| (key(k), v.map(|v| Bytes::copy_from_slice(v.as_bytes()))))
            .collect()
    }

    #[test]
    fn get_after_apply() {
        let cache = Cache::new();
        cache.apply(&batch(&[("motions/motion:1", Some(r#"{"id":1}"#))]));
        assert_eq!(
            cache.get(&key("motions/motion:1")),
            Some(Bytes::from_static(br#"{"id":1}"#))
        );
        assert_eq!(cache.get(&key("motions/motion:2")), None);
    }

    #[test]
    fn tombstone_reads_as_absent_but_is_distinguishable() {
        let cache = Cache::new();
        cache.apply(&batch(&[("agenda/item:7", Some(r#"{"id":7}"#))]));
        cache.apply(&batch(&[("agenda/item:7", None)]));

        assert_eq!(cache.get(&key("agenda/item:7")), None);
        assert_eq!(cache.entry(&key("agenda/item:7")), Some(Entry::Tombstone));
        assert_eq!(cache.entry(&key("agenda/item:8")), None);
    }

    #[test]
    fn get_many_omits_tombstones_and_absent() {
        let cache = Cache::new();
        cache.apply(&batch(&[
            ("users/user:1", Some(r#"{"id":1}"#)),
            ("users/user:2", None),
        ]));

        let got = cache.get_many(&[key("users/user:1"), key("users/user:2"), key("users/user:3")]);
        assert_eq!(got.len(), 1);
        assert!(got.contains_key(&key("users/user:1")));
    }

    #[test]
    fn deleted_then_recreated_key_holds_new_value() {
        let cache = Cache::new();
        cache.apply(&batch(&[("motions/motion:5", Some(r#"{"v":1}"#))]));
        cache.apply(&batch(&[("motions/motion:5", None)]));
        cache.apply(&batch(&[("motions/motion:5", Some(r#"{"v":2}"#))]));

        assert_eq!(
            cache.get(&key("motions/motion:5")),
            Some(Bytes::from_static(br#"{"v":2}"#))
        );
    }

    #[test]
    fn collection_returns_live_values_sorted() {
        let cache = Cache::new();
        cache.apply(&batch(&[
            ("agenda/item:2", Some(r#"{"id":2}"#)),
            ("agenda/item:1", Some(r#"{"id":1}"#)),
            ("agenda/item:3", None),
            ("agenda/list-of-speakers:1", Some(r#"{"id":1}"#)),
        ]));

        let items = cache.collection("agenda/item");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, key("agenda/item:1"));
        assert_eq!(items[1].0, key("agenda/item:2"));
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let cache = Cache::new();
        cache.apply(&batch(&[("users/user:1", Some(r#"{"id":1}"#))]));
        let snap = cache.snapshot();
        cache.apply(&batch(&[("users/user:1", None)]));

        assert_eq!(
            snap.get(&key("users/user:1")),
            Some(&Entry::Value(Bytes::from_static(br#"{"id":1}"#)))
        );
        assert_eq!(cache.entry(&key("users/user:1")), Some(Entry::Tombstone));
    }

    #[test]
    fn merged_batches_equal_sequential_batches() {
        let a = Cache::new();
        a.apply(&batch(&[("users/user:1", Some(r#"{"v":1}"#))]));
        a.apply(&batch(&[
            ("users/user:1", Some(r#"{"v":2}"#)),
            ("users/user:2", None),
        ]));

        let b = Cache::new();
        b.apply(&batch(&[
            ("users/user:1", Some(r#"{"v":2}"#)),
            ("users/user:2", None),
        ]));

        assert_eq!(a.snapshot(), b.snapshot());
    }
}
