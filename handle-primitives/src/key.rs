//! Handle identity: the `(class, id)` pair that names a tracked resource.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Opaque handle value as returned by the foreign library. Kept as a plain
/// integer since the manager never interprets it beyond equality and
/// hashing; the caller-supplied destructor is the only code that gives it
/// meaning.
pub type HandleId = u64;

/// Caller-chosen category tag distinguishing handle namespaces (e.g. one
/// tag per resource type owned by the foreign library).
///
/// Backed by `Arc<str>` rather than `String` so that cloning a
/// [`HandleKey`] into a dependency set or across the registry's map never
/// allocates.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct HandleClass(Arc<str>);

impl HandleClass {
    /// Creates a class tag from any string-like value.
    #[must_use]
    pub fn new(class: impl Into<Arc<str>>) -> Self {
        Self(class.into())
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HandleClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for HandleClass {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for HandleClass {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Identity of a tracked handle: a category tag plus the opaque id within
/// that category. Immutable once constructed; compared by value.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct HandleKey {
    class: HandleClass,
    id: HandleId,
}

impl HandleKey {
    /// Constructs a key from a class and id.
    pub fn new(class: impl Into<HandleClass>, id: HandleId) -> Self {
        Self {
            class: class.into(),
            id,
        }
    }

    /// Returns the class tag.
    #[must_use]
    pub fn class(&self) -> &HandleClass {
        &self.class
    }

    /// Returns the opaque handle id.
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }
}

impl Display for HandleKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compare_by_value() {
        let a = HandleKey::new("socket", 7);
        let b = HandleKey::new("socket", 7);
        let c = HandleKey::new("socket", 8);
        let d = HandleKey::new("file", 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn class_from_str_and_string_agree() {
        let from_str: HandleClass = "socket".into();
        let from_string: HandleClass = String::from("socket").into();
        assert_eq!(from_str, from_string);
    }
}
