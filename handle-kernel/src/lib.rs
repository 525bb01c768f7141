//! Concurrent handle lifetime manager: a [`Registry`] of reference-counted
//! [`HandleContext`]s tied together by dependency edges, destroyed off the
//! caller's thread by a single-consumer [`UnregistrationAgent`].
//!
//! ```
//! use std::sync::Arc;
//! use handle_kernel::{Registry, RegistryConfig};
//! use handle_primitives::HandleClass;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Registry::new(RegistryConfig::default());
//! registry
//!     .register(HandleClass::new("socket"), 1, None, None)
//!     .unwrap();
//! registry.unregister(HandleClass::new("socket"), 1).unwrap();
//! registry.stop_agent().await;
//! assert!(registry.is_empty());
//! # }
//! ```

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod context;
mod deps;
mod registry;

/// The unregistration agent and its configuration/error types.
pub use agent::{AgentConfig, AgentError, AgentResult};
/// Per-handle refcount/destructor/dependency state.
pub use context::HandleContext;
/// The dependency-edge collection attached to a context.
pub use deps::DependencySet;
/// The registry itself and its configuration type.
pub use registry::{Registry, RegistryConfig};

pub use handle_primitives::{
    Destructor, ErrorSink, HandleClass, HandleError, HandleId, HandleKey, HandleResult,
    TracingErrorSink,
};
