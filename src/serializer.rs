//! Property value codecs.
//!
//! Absent or empty node data always decodes to the type's empty value so
//! that a property whose path exists without data is not an error.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CoordError, Result};

/// Converts property values to and from node data.
pub trait Serializer<T>: Send + Sync {
    /// Encode a value.
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode node data. `None` and empty data yield the empty value.
    fn from_bytes(&self, bytes: Option<&[u8]>) -> Result<T>;
}

/// UTF-8 strings. Used for symlink targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn to_bytes(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn from_bytes(&self, bytes: Option<&[u8]>) -> Result<String> {
        match bytes {
            None => Ok(String::new()),
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| CoordError::Serialization(e.to_string())),
        }
    }
}

/// JSON via serde_json.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Into::into)
    }

    fn from_bytes(&self, bytes: Option<&[u8]>) -> Result<T> {
        match bytes {
            None => Ok(T::default()),
            Some(bytes) if bytes.is_empty() => Ok(T::default()),
            Some(bytes) => serde_json::from_slice(bytes).map_err(Into::into),
        }
    }
}

/// Sets of strings, one element per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSetSerializer;

impl Serializer<BTreeSet<String>> for StringSetSerializer {
    fn to_bytes(&self, value: &BTreeSet<String>) -> Result<Vec<u8>> {
        if let Some(bad) = value.iter().find(|item| item.contains('\n')) {
            return Err(CoordError::Serialization(format!(
                "set element contains a newline: {:?}",
                bad
            )));
        }
        Ok(value
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes())
    }

    fn from_bytes(&self, bytes: Option<&[u8]>) -> Result<BTreeSet<String>> {
        let text = StringSerializer.from_bytes(bytes)?;
        Ok(text
            .split('\n')
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Maps of child name to child value.
///
/// Encoded as a JSON object holding each child's own encoding, so any child
/// codec can be nested. Used for [`ChildrenData`](crate::store::ChildrenData)
/// views.
pub struct ChildMapSerializer<V> {
    child: Arc<dyn Serializer<V>>,
}

impl<V> ChildMapSerializer<V> {
    pub fn new(child: Arc<dyn Serializer<V>>) -> Self {
        Self { child }
    }
}

impl<V> Serializer<BTreeMap<String, V>> for ChildMapSerializer<V> {
    fn to_bytes(&self, value: &BTreeMap<String, V>) -> Result<Vec<u8>> {
        let mut encoded = BTreeMap::new();
        for (name, child) in value {
            encoded.insert(name.as_str(), self.child.to_bytes(child)?);
        }
        serde_json::to_vec(&encoded).map_err(Into::into)
    }

    fn from_bytes(&self, bytes: Option<&[u8]>) -> Result<BTreeMap<String, V>> {
        let bytes = match bytes {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Ok(BTreeMap::new()),
        };
        let encoded: BTreeMap<String, Vec<u8>> = serde_json::from_slice(bytes)?;
        encoded
            .into_iter()
            .map(|(name, data)| Ok((name, self.child.from_bytes(Some(&data))?)))
            .collect()
    }
}
