//! Process termination signals.

use std::future::Future;

/// Listen for Ctrl-C and, on unix, SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a signal sent
/// after the call is not lost. The returned future resolves on the first one.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            result = tokio::signal::ctrl_c() => log_ctrl_c(result),
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }

        #[cfg(not(unix))]
        log_ctrl_c(tokio::signal::ctrl_c().await);
    })
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::info!("Received Ctrl-C"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
    }
}
