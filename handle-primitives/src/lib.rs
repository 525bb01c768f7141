//! Core shared types for the handle-registry runtime: handle identity, the
//! closed error set of the registration protocol, and the error-sink
//! callback point used by asynchronous destruction.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod key;

/// Destructor type and the closed error set of the registration protocol.
pub use error::{Destructor, ErrorSink, HandleError, HandleResult, TracingErrorSink};
/// Handle identity types.
pub use key::{HandleClass, HandleId, HandleKey};
