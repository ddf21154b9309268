//! Command implementations.

pub mod config;
pub mod node;
pub mod probe;
pub mod relay;

/// Resolves once Ctrl+C is pressed.
pub(crate) async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
}
