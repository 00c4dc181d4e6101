//! Element keys.
//!
//! A key addresses one element in the mirrored object graph as
//! `<collection>:<id>`. Collections are lowercase paths like
//! `motions/motion`; ids are positive integers.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

/// Key of one element: `<collection>:<id>`.
///
/// Stored in canonical form. Collection must match
/// `[a-z_][a-z0-9_/-]*`, id must be a positive integer.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    raw: String,
    colon: usize,
}

impl Key {
    /// Parse and validate a raw key string.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let Some((collection, id_raw)) = s.rsplit_once(':') else {
            return Err(KeyError::MissingSeparator { raw: s.to_string() });
        };

        validate_collection(collection).map_err(|reason| KeyError::InvalidCollection {
            raw: s.to_string(),
            reason,
        })?;

        let id: u64 = id_raw.parse().map_err(|_| KeyError::InvalidId {
            raw: s.to_string(),
        })?;
        if id == 0 {
            return Err(KeyError::InvalidId {
                raw: s.to_string(),
            });
        }

        Ok(Self {
            raw: s.to_string(),
            colon: collection.len(),
        })
    }

    /// Build a key from parts. The collection must already be valid.
    pub fn new(collection: &str, id: u64) -> Result<Self, KeyError> {
        Self::parse(&format!("{collection}:{id}"))
    }

    pub fn collection(&self) -> &str {
        &self.raw[..self.colon]
    }

    pub fn id(&self) -> u64 {
        // Validated at construction.
        self.raw[self.colon + 1..].parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn validate_collection(collection: &str) -> Result<(), &'static str> {
    let mut bytes = collection.bytes();
    match bytes.next() {
        None => return Err("empty collection"),
        Some(c) if c.is_ascii_lowercase() || c == b'_' => {}
        Some(_) => return Err("collection must start with a-z or _"),
    }
    for c in bytes {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, b'_' | b'/' | b'-')) {
            return Err("collection contains invalid character");
        }
    }
    Ok(())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.raw)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Key::parse(&raw).map_err(de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key {raw:?} is missing the ':' separator")]
    MissingSeparator { raw: String },
    #[error("key {raw:?} has an invalid collection: {reason}")]
    InvalidCollection { raw: String, reason: &'static str },
    #[error("key {raw:?} has an invalid id (want positive integer)")]
    InvalidId { raw: String },
}
