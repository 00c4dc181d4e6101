//! Change batches.
//!
//! One batch carries the element changes belonging to a single change id.
//! Values stay opaque JSON bytes; a JSON `null` marks a deleted element.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;

use super::key::{Key, KeyError};

/// The element changes of one change id.
///
/// `None` values are deletions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub change_id: u64,
    pub elements: BTreeMap<Key, Option<Bytes>>,
}

impl ChangeBatch {
    pub fn new(change_id: u64) -> Self {
        Self {
            change_id,
            elements: BTreeMap::new(),
        }
    }

    /// Decode the upstream wire form `{"elements": {key: value|null}, "change_id": n}`.
    pub fn decode(raw: &[u8]) -> Result<Self, BatchError> {
        #[derive(Deserialize)]
        struct Wire<'a> {
            #[serde(borrow)]
            elements: BTreeMap<&'a str, Option<&'a RawValue>>,
            change_id: u64,
        }

        let wire: Wire<'_> = serde_json::from_slice(raw)?;

        let mut elements = BTreeMap::new();
        for (raw_key, value) in wire.elements {
            let key = Key::parse(raw_key)?;
            let value = value.map(|v| Bytes::copy_from_slice(v.get().as_bytes()));
            elements.insert(key, value);
        }

        Ok(Self {
            change_id: wire.change_id,
            elements,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.elements.keys()
    }

    /// True if the batch changes any element of the collection.
    pub fn touches(&self, collection: &str) -> bool {
        self.elements
            .keys()
            .any(|key| key.collection() == collection)
    }

    pub fn insert(&mut self, key: Key, value: Option<Bytes>) {
        self.elements.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_values_and_nulls() {
        let raw = br#"{"elements":{"motions/motion:1":{"id":1,"title":"A"},"agenda/item:7":null},"change_id":6}"#;
        let batch = ChangeBatch::decode(raw).unwrap();

        assert_eq!(batch.change_id, 6);
        assert_eq!(batch.len(), 2);

        let motion = batch
            .elements
            .get(&Key::parse("motions/motion:1").unwrap())
            .unwrap();
        assert_eq!(
            motion.as_ref().map(|b| b.as_ref()),
            Some(br#"{"id":1,"title":"A"}"#.as_ref())
        );

        let item = batch
            .elements
            .get(&Key::parse("agenda/item:7").unwrap())
            .unwrap();
        assert!(item.is_none());
    }

    #[test]
    fn preserves_value_bytes_verbatim() {
        // Field order inside the opaque value must survive the decode.
        let raw = br#"{"elements":{"users/user:2":{"b":1,"a":2}},"change_id":3}"#;
        let batch = ChangeBatch::decode(raw).unwrap();
        let user = batch
            .elements
            .get(&Key::parse("users/user:2").unwrap())
            .unwrap();
        assert_eq!(
            user.as_ref().map(|b| b.as_ref()),
            Some(br#"{"b":1,"a":2}"#.as_ref())
        );
    }

    #[test]
    fn rejects_invalid_keys() {
        let raw = br#"{"elements":{"Motions:1":{}},"change_id":1}"#;
        assert!(matches!(
            ChangeBatch::decode(raw),
            Err(BatchError::Key(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            ChangeBatch::decode(b"{\"elements\":"),
            Err(BatchError::Json(_))
        ));
    }

    #[test]
    fn touches_matches_collection_exactly() {
        let raw = br#"{"elements":{"users/user:1":{}},"change_id":1}"#;
        let batch = ChangeBatch::decode(raw).unwrap();
        assert!(batch.touches("users/user"));
        assert!(!batch.touches("users"));
        assert!(!batch.touches("users/group"));
    }
}
