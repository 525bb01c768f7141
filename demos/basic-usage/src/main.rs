//! Minimal example demonstrating the handle-registry runtime: a parent
//! handle that depends on a child, torn down through the public API.

use std::sync::Arc;

use anyhow::Result;
use handle_kernel::{ErrorSink, HandleError, HandleKey, Registry, RegistryConfig};
use handle_primitives::HandleClass;
use tracing::info;

struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn on_error(&self, key: &HandleKey, error: &HandleError) {
        tracing::error!(handle = %key, error = %error, "destruction error reported to sink");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let registry = Registry::new(RegistryConfig::default());
    registry.set_error_sink(Arc::new(LoggingErrorSink));

    let socket = HandleClass::new("socket");
    let buffer = HandleClass::new("buffer");

    registry.register(
        buffer.clone(),
        1,
        Some(Arc::new(|id| {
            info!(id, "releasing buffer");
            Ok(())
        })),
        None,
    )?;

    let buffer_key = HandleKey::new(buffer.clone(), 1);
    registry.register(
        socket.clone(),
        1,
        Some(Arc::new(|id| {
            info!(id, "closing socket");
            Ok(())
        })),
        Some(vec![buffer_key]),
    )?;

    info!("registered socket depending on buffer");

    registry.unregister(socket, 1)?;
    registry.unregister(buffer, 1)?;

    registry.stop_agent().await;
    info!(remaining = registry.len(), "shutdown complete");
    Ok(())
}
