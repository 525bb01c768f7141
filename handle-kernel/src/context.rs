//! Per-handle state: refcount, destructor, and dependency set.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};

use handle_primitives::{Destructor, HandleId, HandleKey};

use crate::deps::DependencySet;

/// Per-key record tracked by the [`crate::registry::Registry`]. `AddRef`
/// and `Release` are linearizable against each other on a single context;
/// no ordering is required between different contexts.
pub struct HandleContext {
    refcount: AtomicI64,
    destructor: Mutex<Option<Destructor>>,
    dependencies: RwLock<Option<DependencySet>>,
}

impl HandleContext {
    /// Creates a fresh context with refcount 1, the given destructor, and
    /// no dependency set (`None`, distinct from an empty set).
    #[must_use]
    pub fn new(destructor: Option<Destructor>) -> Self {
        Self {
            refcount: AtomicI64::new(1),
            destructor: Mutex::new(destructor),
            dependencies: RwLock::new(None),
        }
    }

    /// Returns the current refcount without mutating it.
    #[must_use]
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Atomically increments the refcount, returning the post-increment
    /// value.
    pub fn add_ref(&self) -> i64 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Atomically decrements the refcount, returning the post-decrement
    /// value. A negative result is an invariant breach the caller must
    /// surface as [`handle_primitives::HandleError::InvalidRefCount`].
    pub fn release(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Overwrites the stored destructor, latest-writer-wins, including
    /// with `None`, on every `Register` reuse; see `DESIGN.md` for the
    /// rationale.
    pub fn set_destructor(&self, destructor: Option<Destructor>) {
        *self.destructor.lock().expect("handle context poisoned") = destructor;
    }

    /// Invokes the stored destructor exactly once; subsequent calls are
    /// no-ops. Errors raised by the destructor propagate to the caller,
    /// who is responsible for routing them to the error sink without
    /// skipping the remaining cleanup.
    pub fn run_destructor(&self, id: HandleId) -> anyhow::Result<()> {
        let taken = self
            .destructor
            .lock()
            .expect("handle context poisoned")
            .take();
        match taken {
            Some(destructor) => destructor(id),
            None => Ok(()),
        }
    }

    /// Lazily creates the dependency set if absent, then adds `dep` to it.
    /// Returns `true` if the edge was newly inserted.
    pub fn add_dependency(&self, dep: HandleKey) -> bool {
        self.dependencies
            .write()
            .expect("handle context poisoned")
            .get_or_insert_with(DependencySet::new)
            .add(dep)
    }

    /// Removes `dep` from the dependency set if present. Returns `true` if
    /// an edge was removed; `false` if the set is absent or did not
    /// contain `dep`.
    pub fn remove_dependency(&self, dep: &HandleKey) -> bool {
        self.dependencies
            .write()
            .expect("handle context poisoned")
            .as_mut()
            .is_some_and(|set| set.remove(dep))
    }

    /// Returns `true` if the dependency set is present and contains `dep`.
    #[must_use]
    pub fn has_dependency(&self, dep: &HandleKey) -> bool {
        self.dependencies
            .read()
            .expect("handle context poisoned")
            .as_ref()
            .is_some_and(|set| set.contains(dep))
    }

    /// Snapshots the dependency keys for teardown iteration. Returns an
    /// empty vector both when the set is absent and when it is present but
    /// empty — destruction treats the two identically.
    #[must_use]
    pub fn dependency_snapshot(&self) -> Vec<HandleKey> {
        self.dependencies
            .read()
            .expect("handle context poisoned")
            .as_ref()
            .map(DependencySet::iter_cloned)
            .unwrap_or_default()
    }
}
