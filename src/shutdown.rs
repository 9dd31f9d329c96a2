use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Bridge process signals into the engine's cancellation tree.
///
/// The returned token fires on SIGTERM or SIGINT. Once it does, the
/// orchestrator stops issuing leases and drains in-flight scans within
/// the configured grace window.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Initiating graceful shutdown");
        trigger.cancel();
    });

    token
}
