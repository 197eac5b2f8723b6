use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A cheaply clonable JSON value passed between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[repr(transparent)]
pub struct ValueRef(Arc<serde_json::Value>);

impl<T: Into<serde_json::Value>> From<T> for ValueRef {
    fn from(value: T) -> Self {
        Self::new(value.into())
    }
}

impl ValueRef {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn null() -> Self {
        Self::new(serde_json::Value::Null)
    }

    /// Resolve a `/`-separated path against this value.
    ///
    /// Each segment is an object field name, or an array index when the
    /// current value is an array and the segment parses as an index.
    /// A leading `/` is accepted and ignored, so both `a/b/0` and `/a/b/0`
    /// address the same element. Returns `None` when any segment does not
    /// resolve.
    pub fn path(&self, path: &str) -> Option<ValueRef> {
        let mut current = self.as_ref();
        for segment in path.trim_start_matches('/').split('/') {
            if segment.is_empty() {
                continue;
            }
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            };
        }
        Some(ValueRef::new(current.clone()))
    }

    /// Truthiness used for branch conditions: `null`, `false`, `0`, the
    /// empty string, and empty collections are false; everything else is
    /// true.
    pub fn is_truthy(&self) -> bool {
        match self.as_ref() {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
        }
    }

    pub fn as_array(&self) -> Option<&[serde_json::Value]> {
        self.as_ref().as_array().map(|v| v.as_slice())
    }
}

impl AsRef<serde_json::Value> for ValueRef {
    fn as_ref(&self) -> &serde_json::Value {
        &self.0
    }
}
