//! Background cleanup of abandoned conversations

use super::traits::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delete conversations idle for longer than `retention`, once per `every`,
/// until `shutdown` is cancelled.
pub fn spawn_sweeper(
    store: Arc<dyn StateStore>,
    retention: chrono::Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = chrono::Utc::now() - retention;
                    match store.sweep_stale(cutoff).await {
                        Ok(0) => tracing::debug!("Sweep found nothing to remove"),
                        Ok(removed) => tracing::info!(removed, cutoff = %cutoff, "Swept stale conversations"),
                        Err(e) => tracing::warn!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
        tracing::info!("Sweeper stopped");
    })
}
