//! Resources: named instrument channels
//!
//! A resource is a single readable and/or writable channel on some device
//! (a voltage source output, a lock-in amplifier reading, a magnet setpoint).
//! Drivers for specific instrument models live outside this crate; the
//! sweep only needs the small contract below.
//!
//! # Contract
//! - `readable()` / `writable()` are fixed for the lifetime of the resource
//! - `write` and `read` may block on device I/O; the sweep imposes no timeout
//! - both may fail, and failures are reported with `anyhow::Result`
//!
//! # Thread Safety
//! Methods take `&self`; implementations use interior mutability. Only the
//! sweep's run task ever calls `write`/`read` on a bound resource.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value written to or read from a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Integer-valued setting or reading
    Integer(i64),
    /// Floating point setting or reading
    Float(f64),
    /// Free-form reading (status words, identifiers)
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// Capability: a named instrument channel
#[async_trait]
pub trait Resource: Send + Sync {
    /// Whether `read` is supported
    fn readable(&self) -> bool;

    /// Whether `write` is supported
    fn writable(&self) -> bool;

    /// Write a value to the channel
    ///
    /// # Returns
    /// - Ok(()) once the device accepted the value
    /// - Err on rejection or communication failure
    async fn write(&self, value: Value) -> Result<()>;

    /// Read the current value of the channel
    async fn read(&self) -> Result<Value>;
}

/// Registry of live resources, keyed by name.
#[derive(Default, Clone)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<dyn Resource>>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under `name`, replacing any previous entry
    pub fn insert(&mut self, name: impl Into<String>, resource: Arc<dyn Resource>) {
        self.resources.insert(name.into(), resource);
    }

    /// Look up a resource by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.names())
            .finish()
    }
}
