use tracing::{error, info};

/// Resolve when the process receives a shutdown signal: SIGINT or SIGTERM on
/// Unix, Ctrl+C elsewhere. Used as the server's graceful-shutdown trigger,
/// so a failure to install a handler is logged rather than propagated.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            return;
        }
        info!("received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_signal_waits() {
        // no signal is sent, so the future must still be pending
        let result = timeout(Duration::from_millis(50), shutdown_signal()).await;
        assert!(result.is_err(), "should time out waiting for a signal");
    }
}
