//! Error kinds shared by the registration protocol and the unregistration
//! agent, plus the error-sink callback point used by asynchronous
//! destruction.

use std::sync::Arc;

use thiserror::Error;

use crate::key::HandleKey;

/// Result alias used by the synchronous registry API.
pub type HandleResult<T> = Result<T, HandleError>;

/// Errors produced by the registration protocol. Each variant names the
/// offending key so the error-sink callback and synchronous callers alike
/// can report precisely what failed.
#[derive(Debug, Error)]
pub enum HandleError {
    /// A lookup of a required key failed — the key is neither registered
    /// nor in the process of being registered.
    #[error("handle {0} is not registered")]
    ObjectNotFound(HandleKey),

    /// A refcount was observed in an illegal state: non-positive on
    /// `AddRef` after a successful lookup, or negative on `Release`.
    #[error("handle {key} observed an invalid refcount of {value}")]
    InvalidRefCount {
        /// The handle whose refcount is invalid.
        key: HandleKey,
        /// The illegal value that was observed.
        value: i64,
    },

    /// `RemoveDependency` was asked to remove an edge that is not present
    /// on the parent's dependency set.
    #[error("handle {parent} has no dependency edge to {dep}")]
    DependencyNotFound {
        /// The handle the edge was looked up on.
        parent: HandleKey,
        /// The dependency that was not found.
        dep: HandleKey,
    },

    /// The concurrent map reported a key as absent during the removal step
    /// of destruction, when it should still have been present.
    #[error("handle {0} was already absent during removal")]
    FailedObjectRemoval(HandleKey),

    /// The caller-supplied destructor raised an error. Destruction still
    /// proceeds to release dependency edges and remove the entry from the
    /// map; a failing destructor never aborts the rest of teardown.
    #[error("destructor for handle {key} failed: {source}")]
    DestructorFailure {
        /// The handle whose destructor failed.
        key: HandleKey,
        /// The error the destructor raised.
        source: anyhow::Error,
    },
}

impl HandleError {
    /// Returns the key the error pertains to, when the variant carries one.
    #[must_use]
    pub fn key(&self) -> &HandleKey {
        match self {
            Self::ObjectNotFound(key)
            | Self::FailedObjectRemoval(key)
            | Self::InvalidRefCount { key, .. }
            | Self::DestructorFailure { key, .. } => key,
            Self::DependencyNotFound { parent, .. } => parent,
        }
    }
}

/// Caller-supplied destructor for a handle id. Invoked at most once per
/// handle context. May raise any error; the caller is not expected to
/// define a closed error set of its own, since this code never interprets
/// destructor failures beyond reporting them.
pub type Destructor = Arc<dyn Fn(crate::key::HandleId) -> anyhow::Result<()> + Send + Sync>;

/// Caller-supplied sink for errors raised during asynchronous destruction.
/// Modeled as a trait object rather than a bare closure, consistent with
/// how pluggable callbacks are expressed throughout this codebase
/// (registry hooks, policy decisions, audit emission all go through a
/// trait, never a `Fn` parameter).
pub trait ErrorSink: Send + Sync {
    /// Reports an error encountered while destroying `key`. Called from
    /// the single unregistration-agent consumer thread; implementations
    /// must not block it for long.
    fn on_error(&self, key: &HandleKey, error: &HandleError);
}

/// Default error sink: logs via `tracing::warn!` and nothing else. Used
/// when a caller never registers one of their own, so destruction errors
/// are never silently lost in development.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn on_error(&self, key: &HandleKey, error: &HandleError) {
        tracing::warn!(handle = %key, error = %error, "asynchronous destruction failed");
    }
}
