//! Graceful shutdown handling.
//!
//! Translates SIGINT/SIGTERM into a broadcast signal the HTTP server and the
//! reconcile scheduler both observe.

use tokio::sync::broadcast;
use tracing::info;

/// Create a shutdown signal receiver.
///
/// Returns a broadcast receiver that fires when SIGINT or SIGTERM arrives.
/// Call `resubscribe()` on the result for additional listeners.
pub fn shutdown_signal() -> broadcast::Receiver<()> {
    let (tx, rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT");
            }
            _ = terminate => {
                info!("received SIGTERM");
            }
        }

        let _ = tx.send(());
    });

    rx
}
