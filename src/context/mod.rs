//! Key/value context threaded through one request/response lifetime.
//!
//! A [`Context`] is written by pre-request handlers and read back by response
//! handlers, including when the response is synthesized from the cache. Two
//! backing stores are available:
//!
//! - [`ContextKind::ReadHeavy`] - a sharded [`DashMap`]; readers on different
//!   shards never contend.
//! - [`ContextKind::WriteHeavy`] - a `HashMap` behind an `RwLock`; writes take
//!   the exclusive lock, reads the shared one.
//!
//! # Example
//!
//! ```
//! use predator::context::{Context, ContextKind};
//!
//! let ctx = Context::new(ContextKind::ReadHeavy);
//! ctx.put("page", 3);
//! ctx.put("category", "books");
//! assert_eq!(ctx.get_string("category"), "books");
//! assert_eq!(ctx.to_json_string(), r#"{"category":"books","page":3}"#);
//! ```

mod pool;

pub use pool::{ContextPool, DEFAULT_CONTEXT_POOL_CAPACITY};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Selects the backing store of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Concurrent sharded map, for many readers and occasional writers.
    #[default]
    ReadHeavy,
    /// Ordinary map behind a read-write lock, for write-dominated usage.
    WriteHeavy,
}

/// A value stored in a [`Context`].
#[derive(Clone)]
pub enum Value {
    /// UTF-8 text.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// Structured JSON document.
    Json(serde_json::Value),
    /// Any other shareable value; retrieve with [`Context::get_opaque`].
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Returns the string payload, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an `i64` when it is an integer that fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::UInt(u) => serde_json::Value::from(*u),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::UInt(u) => write!(f, "{u}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Opaque(_) => f.write_str("Opaque(..)"),
            other => write!(f, "{other}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::UInt(value as u64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

enum Store {
    ReadHeavy(DashMap<String, Value>),
    WriteHeavy(RwLock<HashMap<String, Value>>),
}

/// Shared handle to a request/response key-value bag.
///
/// Cloning a `Context` clones the handle, not the contents: every clone observes
/// the same entries.
#[derive(Clone)]
pub struct Context {
    store: Arc<Store>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.kind())
            .field("len", &self.length())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextKind::default())
    }
}

impl Context {
    /// Creates an empty context with the given backing store.
    #[must_use]
    pub fn new(kind: ContextKind) -> Self {
        let store = match kind {
            ContextKind::ReadHeavy => Store::ReadHeavy(DashMap::new()),
            ContextKind::WriteHeavy => Store::WriteHeavy(RwLock::new(HashMap::new())),
        };
        Self {
            store: Arc::new(store),
        }
    }

    /// Returns which backing store this context uses.
    #[must_use]
    pub fn kind(&self) -> ContextKind {
        match self.store.as_ref() {
            Store::ReadHeavy(_) => ContextKind::ReadHeavy,
            Store::WriteHeavy(_) => ContextKind::WriteHeavy,
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.store.as_ref() {
            Store::ReadHeavy(map) => {
                map.insert(key, value);
            }
            Store::WriteHeavy(lock) => {
                lock.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, value);
            }
        }
    }

    /// Returns the string stored under `key`, or an empty string when the key is
    /// absent or holds a non-string value.
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.with_value(key, |value| value.as_str().map(str::to_string))
            .flatten()
            .unwrap_or_default()
    }

    /// Returns a clone of the value stored under `key`.
    #[must_use]
    pub fn get_any(&self, key: &str) -> Option<Value> {
        self.with_value(key, Value::clone)
    }

    /// Returns the opaque value under `key` downcast to `T`.
    #[must_use]
    pub fn get_opaque<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.get_any(key)? {
            Value::Opaque(any) => any.downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Removes `key`.
    pub fn delete(&self, key: &str) {
        let _ = self.get_and_delete(key);
    }

    /// Removes `key` and returns the value it held.
    pub fn get_and_delete(&self, key: &str) -> Option<Value> {
        match self.store.as_ref() {
            Store::ReadHeavy(map) => map.remove(key).map(|(_, value)| value),
            Store::WriteHeavy(lock) => lock
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key),
        }
    }

    /// Applies `f` to every entry and collects the results.
    ///
    /// Iteration order is unspecified.
    pub fn for_each<T>(&self, mut f: impl FnMut(&str, &Value) -> T) -> Vec<T> {
        match self.store.as_ref() {
            Store::ReadHeavy(map) => map
                .iter()
                .map(|entry| f(entry.key(), entry.value()))
                .collect(),
            Store::WriteHeavy(lock) => lock
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(key, value)| f(key, value))
                .collect(),
        }
    }

    /// Removes every entry, keeping the allocated capacity.
    pub fn clear(&self) {
        match self.store.as_ref() {
            Store::ReadHeavy(map) => map.clear(),
            Store::WriteHeavy(lock) => lock.write().unwrap_or_else(PoisonError::into_inner).clear(),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn length(&self) -> usize {
        match self.store.as_ref() {
            Store::ReadHeavy(map) => map.len(),
            Store::WriteHeavy(lock) => lock.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    /// Serializes the context as a JSON object with keys in sorted order.
    ///
    /// Strings stay strings and integers are emitted unquoted; every other value
    /// is rendered through its `Display` form and quoted.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        let object: serde_json::Map<String, serde_json::Value> = self
            .for_each(|key, value| (key.to_string(), value.to_json()))
            .into_iter()
            .collect();
        serde_json::Value::Object(object).to_string()
    }

    /// Number of live handles to this context, used by [`ContextPool`] to decide
    /// whether an instance can be recycled.
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.store)
    }

    fn with_value<T>(&self, key: &str, f: impl FnOnce(&Value) -> T) -> Option<T> {
        match self.store.as_ref() {
            Store::ReadHeavy(map) => map.get(key).map(|entry| f(entry.value())),
            Store::WriteHeavy(lock) => lock
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .map(f),
        }
    }
}
