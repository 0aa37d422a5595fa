use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
///
/// The consumer stops reading, drains queued landings, then exits.
pub(crate) fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!(
                    "Received shutdown signal ({}), draining in-flight landings...",
                    signal
                );
                shutdown.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "Ctrl+C"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl+C")
}
