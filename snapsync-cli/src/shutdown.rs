//! Turns SIGINT and SIGTERM into cancellation of the running operation.
//!
//! The blocking sync observes the token between items and before each
//! commit phase, so an interrupted run rolls back instead of dying mid-write.

use tokio::signal;
use tokio_util::sync::CancellationToken;

pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, cancelling"),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling"),
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}
