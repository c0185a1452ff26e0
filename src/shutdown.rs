use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::execution::QueueManager;

/// Install a handler for SIGTERM and SIGINT.
///
/// The returned token is cancelled on the first of either signal. Signal
/// registration happens before this returns, so a failure surfaces here
/// instead of inside the spawned task.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
            }
            _ = trigger.cancelled() => return,
        }
        trigger.cancel();
    });

    Ok(token)
}

/// Wait up to `grace` for the queue to empty. Returns false if items were
/// still pending or running when the grace period ran out.
pub async fn drain_queue(manager: &QueueManager, grace: Duration) -> bool {
    let pending = manager.pending().await;
    if pending > 0 || manager.is_processing() {
        tracing::info!(pending, grace_ms = grace.as_millis() as u64, "Draining execution queue");
    }

    match tokio::time::timeout(grace, manager.drain()).await {
        Ok(()) => true,
        Err(_) => {
            let pending = manager.pending().await;
            tracing::warn!(
                pending,
                "Drain grace period elapsed with executions outstanding"
            );
            false
        }
    }
}
