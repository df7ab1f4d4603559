use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Waits for SIGINT, SIGTERM or SIGQUIT and returns the signal's name.
/// SIGHUP, SIGUSR1 and SIGUSR2 are logged and ignored.
pub async fn wait_for_termination() -> Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => return Ok("SIGINT"),
            _ = sigterm.recv() => return Ok("SIGTERM"),
            _ = sigquit.recv() => return Ok("SIGQUIT"),
            _ = sighup.recv() => warn!("SIGHUP received, ignoring"),
            _ = sigusr1.recv() => warn!("SIGUSR1 received, ignoring"),
            _ = sigusr2.recv() => warn!("SIGUSR2 received, ignoring"),
        }
    }
}

/// Fires `graceful_tx` on the first termination signal
pub async fn graceful_shutdown(graceful_tx: watch::Sender<()>) -> Result<()> {
    let name = wait_for_termination().await?;
    info!("{} detected.", name);

    graceful_tx.send(()).map_err(|e| {
        error!("Failed to send shutdown signal: {}", e);
        Error::Fatal(format!("Failed to send shutdown signal: {}", e))
    })?;
    Ok(())
}
