//! Script value model shared between the loop core and its collaborators.
//!
//! This is a minimal, interpreter-neutral representation of JavaScript values.
//! The scheduler never interprets these beyond identity and structure: callback
//! arguments pass through untouched, and the IPC layer walks them to produce
//! structural copies. Functions are opaque handles owned by the interpreter
//! bridge; the core only ever forwards them.
//!
//! Objects preserve insertion order, matching engine enumeration order.

use indexmap::IndexMap;
use std::sync::Arc;

/// An interpreter-neutral JavaScript value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// `undefined`.
    Undefined,
    /// `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number (doubles cover the integer cases the core cares about).
    Number(f64),
    /// An immutable string, shared rather than copied.
    String(Arc<str>),
    /// A byte buffer. Mutable on the script side, so never shared across runtimes.
    Buffer(Vec<u8>),
    /// An array.
    Array(Vec<ScriptValue>),
    /// An object with insertion-ordered string keys.
    Object(IndexMap<String, ScriptValue>),
    /// An opaque function handle, resolvable only by the owning interpreter.
    Function(FunctionRef),
}

/// Opaque handle to a script function registered with the interpreter bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionRef(pub u64);

impl ScriptValue {
    /// Builds a shared string value.
    #[must_use]
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::String(s.into())
    }

    /// Returns true for `undefined`.
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Returns the string slice if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the object map if this is an object value.
    #[must_use]
    pub fn as_object(&self) -> Option<&IndexMap<String, ScriptValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        Self::String(Arc::from(s))
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_share_storage() {
        let a = ScriptValue::string("hello");
        let b = a.clone();
        match (&a, &b) {
            (ScriptValue::String(x), ScriptValue::String(y)) => {
                assert!(Arc::ptr_eq(x, y));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn object_preserves_insertion_order() {
        let mut map = IndexMap::new();
        map.insert("z".to_string(), ScriptValue::from(1.0));
        map.insert("a".to_string(), ScriptValue::from(2.0));
        let obj = ScriptValue::Object(map);
        let keys: Vec<_> = obj.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z".to_string(), "a".to_string()]);
    }
}
