//! Turns process signals into a server shutdown.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancels `shutdown` on SIGINT or SIGTERM (Ctrl+C on Windows).
///
/// Returns without cancelling if the server stops first, or if the signal
/// handlers cannot be installed; the server then keeps running until
/// something else stops it.
pub async fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        received = next_signal() => match received {
            Ok(name) => {
                info!("📡 Received {}, shutting down", name);
                shutdown.cancel();
            }
            Err(e) => error!("Signal handling unavailable: {}", e),
        }
    }
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
