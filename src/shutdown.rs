use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels the given token on the first SIGINT or SIGTERM.
///
/// The driver polls the token between ticks: generation stops and the run
/// transitions straight into its drain phase. A second signal is not
/// handled specially; the drain phase is bounded by its own hard cap.
pub fn spawn_signal_listener(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C signal handler");
            info!("received ctrl+c, gracefully shutting down...");
        };

        #[cfg(unix)]
        let sigterm = async {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm_stream =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
            sigterm_stream.recv().await;
            info!("received SIGTERM, gracefully shutting down...");
        };

        #[cfg(not(unix))]
        let sigterm = async {
            // On non-Unix systems, create a future that never completes
            // so the select! below reduces to ctrl_c.
            std::future::pending::<()>().await;
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm => {}
        }
        cancel.cancel();
    })
}
