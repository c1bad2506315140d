//! Process-signal plumbing shared by both binaries.
//!
//! A single watch channel fans the first SIGINT/SIGTERM/SIGQUIT out to
//! every long-running task; each loop selects on `Receiver::changed()`.

use anyhow::Context;
use tokio::sync::watch;

pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Installs the signal handlers and broadcasts shutdown on the first hit.
pub fn spawn_signal_listener(tx: watch::Sender<bool>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut quit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = terminate.recv() => {},
                _ = quit.recv() => {},
            }
            tracing::info!("shutdown signal received");
            let _ = tx.send(true);
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = tx.send(true);
        });
    }
    Ok(())
}
