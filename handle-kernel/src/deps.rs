//! An idempotent, unordered collection of dependency keys attached to a
//! [`crate::context::HandleContext`].

use std::collections::HashSet;

use handle_primitives::HandleKey;

/// Set of handle keys a context depends on. No ordering requirement;
/// `Add`/`Remove` are idempotent and report whether they changed anything.
#[derive(Debug, Default)]
pub struct DependencySet {
    keys: HashSet<HandleKey>,
}

impl DependencySet {
    /// Creates an empty dependency set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key`, returning `true` if it was not already present.
    pub fn add(&mut self, key: HandleKey) -> bool {
        self.keys.insert(key)
    }

    /// Removes `key`, returning `true` if it was present.
    pub fn remove(&mut self, key: &HandleKey) -> bool {
        self.keys.remove(key)
    }

    /// Returns `true` if `key` is a member of this set.
    #[must_use]
    pub fn contains(&self, key: &HandleKey) -> bool {
        self.keys.contains(key)
    }

    /// Returns the number of dependency edges currently recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no dependency edges are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Clones every member key into a fresh vector, for teardown iteration
    /// that must not hold the set's lock while enqueuing releases.
    #[must_use]
    pub fn iter_cloned(&self) -> Vec<HandleKey> {
        self.keys.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_are_idempotent() {
        let mut set = DependencySet::new();
        let key = HandleKey::new("socket", 1);

        assert!(set.add(key.clone()));
        assert!(!set.add(key.clone()));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&key));
        assert!(!set.remove(&key));
        assert!(set.is_empty());
    }
}
