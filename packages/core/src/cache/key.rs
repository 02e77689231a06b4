//! Deterministic cache keys.
//!
//! A key is built from the function identity, its positional arguments, and
//! its keyword arguments. Arguments are captured as JSON values; keyword
//! arguments live in a `BTreeMap`, and every nested object is re-emitted with
//! sorted keys, so `f(a=1, b=2)` and `f(b=2, a=1)` produce the same key.
//!
//! An argument that cannot be rendered as JSON (a map with non-string keys,
//! say) marks the key unserializable; the cache computes such calls directly
//! instead of storing them under a lossy key.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    function: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    unserializable: Option<String>,
}

impl CacheKey {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            unserializable: None,
        }
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        if let Some(value) = self.capture(value) {
            self.args.push(value);
        }
        self
    }

    /// Set a keyword argument. Insertion order does not affect the key.
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
        if let Some(value) = self.capture(value) {
            self.kwargs.insert(name.to_string(), value);
        }
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Why an argument could not be captured, if one could not.
    pub fn unserializable(&self) -> Option<&str> {
        self.unserializable.as_deref()
    }

    fn capture<T: Serialize + ?Sized>(&mut self, value: &T) -> Option<Value> {
        match serde_json::to_value(value) {
            Ok(value) => Some(canonicalize(value)),
            Err(err) => {
                self.unserializable.get_or_insert_with(|| err.to_string());
                None
            }
        }
    }

    /// Human-readable key, `function:args:kwargs`. Pattern invalidation
    /// matches against this form.
    pub fn readable(&self) -> String {
        let args = serde_json::to_string(&self.args).unwrap_or_default();
        let kwargs = serde_json::to_string(&self.kwargs).unwrap_or_default();
        format!("{}:{}:{}", self.function, args, kwargs)
    }

    /// Hex SHA-256 of the readable form; used as the map key.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.readable().as_bytes());
        hash.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.readable())
    }
}

/// Rebuild objects with keys in sorted order so the rendering never depends
/// on the map type the caller serialised from.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
