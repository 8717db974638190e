//! Signal handling for graceful relay shutdown.

use anyhow::Result;
use tokio::signal;
use tracing::info;

/// Wait for a termination signal.
///
/// Handles SIGINT and SIGTERM on Unix and Ctrl+C on Windows. Returns once
/// one arrives, or with an error if the handlers could not be installed.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
