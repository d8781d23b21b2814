use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::InvalidArgument;

/// Characters that raw stores do not accept in keys.
pub const RESERVED_CHARACTERS: &[char] = &['{', '}', '(', ')', '/', '\\', '@', ':'];

/// Longest plain key that is used verbatim by [`normalize`].
pub const MAX_PLAIN_KEY_LEN: usize = 64;

/// A cache key as accepted by the public API.
///
/// Plain keys are strings or integers. Composite keys are ordered lists or maps of keys,
/// nested arbitrarily. Maps are ordered by their keys, so two structurally equal maps always
/// normalize to the same storage key no matter how they were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Key {
    Str(String),
    Int(i64),
    List(Vec<Key>),
    Map(BTreeMap<String, Key>),
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Self::Int(i.into())
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Self::Int(i.into())
    }
}

impl<K: Into<Key>> From<Vec<K>> for Key {
    fn from(keys: Vec<K>) -> Self {
        Self::List(keys.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<Key>> From<BTreeMap<String, K>> for Key {
    fn from(map: BTreeMap<String, K>) -> Self {
        Self::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<A: Into<Key>, B: Into<Key>> From<(A, B)> for Key {
    fn from((a, b): (A, B)) -> Self {
        Self::List(vec![a.into(), b.into()])
    }
}

impl<A: Into<Key>, B: Into<Key>, C: Into<Key>> From<(A, B, C)> for Key {
    fn from((a, b, c): (A, B, C)) -> Self {
        Self::List(vec![a.into(), b.into(), c.into()])
    }
}

/// Turns a [`Key`] into the canonical string used by the storage layer.
///
/// Plain keys are used verbatim as long as they are short, printable, free of
/// [`RESERVED_CHARACTERS`] and do not start with a `.`. Every other key, and every composite
/// key, is hashed: composites are first rendered as compact JSON with maps sorted by key, and
/// the SHA-256 of that rendering (hex-formatted) becomes the storage key.
///
/// The only key that is rejected is the empty string.
pub fn normalize(key: &Key) -> Result<String, InvalidArgument> {
    match key {
        Key::Str(s) => normalize_plain(s),
        Key::Int(i) => Ok(i.to_string()),
        composite => {
            // Serializing strings, integers, vectors and string-keyed maps cannot fail.
            let json = serde_json::to_string(composite)
                .map_err(|_| InvalidArgument::ReservedCharacters(format!("{composite:?}")))?;
            Ok(hash(&json))
        }
    }
}

fn normalize_plain(key: &str) -> Result<String, InvalidArgument> {
    if key.is_empty() {
        return Err(InvalidArgument::EmptyKey);
    }
    if key.len() > MAX_PLAIN_KEY_LEN || validate(key).is_err() {
        return Ok(hash(key));
    }
    Ok(key.to_owned())
}

fn hash(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Checks that `key` can be used as-is by a raw store.
pub fn validate(key: &str) -> Result<(), InvalidArgument> {
    if key.is_empty() {
        return Err(InvalidArgument::EmptyKey);
    }
    if key.starts_with('.')
        || key
            .chars()
            .any(|c| c.is_control() || RESERVED_CHARACTERS.contains(&c))
    {
        return Err(InvalidArgument::ReservedCharacters(key.to_owned()));
    }
    Ok(())
}
