//! Encryption context canonicalization.
//!
//! An encryption context is additional authenticated data bound into the
//! wrapped data key. It must serialize to the same bytes at encrypt and
//! decrypt time, across providers and over time, or decryption fails.
//!
//! Two canonical forms exist. [`CanonicalMode::Normalized`] sorts keys and
//! coerces every value to a string; it is the only form used for envelopes
//! written in the current format. [`CanonicalMode::Legacy`] preserves
//! insertion order and value types, matching how pre-versioned envelopes
//! bound their context.

use crate::error::Error;
use serde_json::{Map, Value};

/// A single context value. Only strings and integers are representable;
/// providers that accept string values only see integers stringified by
/// the normalized canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    /// String value
    Str(String),
    /// Integer value
    Int(i64),
}

impl ContextValue {
    fn to_json(&self, coerce: bool) -> Value {
        match self {
            Self::Str(s) => Value::String(s.clone()),
            Self::Int(i) if coerce => Value::String(i.to_string()),
            Self::Int(i) => Value::Number((*i).into()),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ContextValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

/// Canonicalization mode, selected per envelope based on the detected
/// format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalMode {
    /// Keys sorted lexicographically, values coerced to strings.
    Normalized,
    /// Insertion order preserved, integer values stay numbers. Used when
    /// decoding envelopes written before format versioning.
    Legacy,
}

/// Encryption context: a mapping of string keys to string or integer values.
///
/// Insertion order is retained so that legacy-mode canonicalization can
/// reproduce the bytes written by pre-versioned envelopes. Inserting an
/// existing key updates its value in place.
///
/// # Example
///
/// ```
/// use zarf::context::{CanonicalMode, EncryptionContext};
///
/// let ctx = EncryptionContext::new().with("user_id", 123).with("table", "users");
/// let bytes = ctx.canonicalize(CanonicalMode::Normalized).unwrap();
/// assert_eq!(bytes, br#"{"table":"users","user_id":"123"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptionContext {
    entries: Vec<(String, ContextValue)>,
}

impl EncryptionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key/value pair, replacing the value of an existing key.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a key/value pair, replacing the value of an existing key
    /// without changing its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Returns true if the context has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Serializes the context to its canonical JSON bytes.
    ///
    /// Normalized mode is a pure function of the logical key/value set:
    /// the same set produces the same bytes regardless of insertion order.
    /// Legacy mode reproduces the insertion-ordered, uncoerced serialization
    /// used before envelope versioning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContext`] if JSON serialization fails.
    pub fn canonicalize(&self, mode: CanonicalMode) -> Result<Vec<u8>, Error> {
        let mut entries: Vec<&(String, ContextValue)> = self.entries.iter().collect();
        let coerce = match mode {
            CanonicalMode::Normalized => {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                true
            }
            CanonicalMode::Legacy => false,
        };

        // serde_json's preserve_order keeps the map in the order built here
        let mut map = Map::with_capacity(entries.len());
        for (key, value) in entries {
            map.insert(key.clone(), value.to_json(coerce));
        }

        serde_json::to_vec(&Value::Object(map)).map_err(|e| Error::InvalidContext(e.to_string()))
    }
}

impl<K: Into<String>, V: Into<ContextValue>> FromIterator<(K, V)> for EncryptionContext {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}

impl TryFrom<&Value> for EncryptionContext {
    type Error = Error;

    /// Builds a context from untyped JSON supplied by a host layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContext`] unless the value is an object whose
    /// values are all strings or integers.
    fn try_from(value: &Value) -> Result<Self, Error> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidContext("context must be an object".to_string()));
        };

        let mut ctx = Self::new();
        for (key, value) in map {
            let value = match value {
                Value::String(s) => ContextValue::Str(s.clone()),
                Value::Number(n) => ContextValue::Int(n.as_i64().ok_or_else(|| {
                    Error::InvalidContext(format!("context value for {key:?} is not an integer"))
                })?),
                _ => {
                    return Err(Error::InvalidContext(format!(
                        "context value for {key:?} must be a string or integer"
                    )))
                }
            };
            ctx.insert(key.clone(), value);
        }
        Ok(ctx)
    }
}
