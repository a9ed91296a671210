//! Periodic expiry sweep.

use crate::services::upload_coordinator::UploadCoordinator;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run `sweep_expired` every `sweep_interval` until `cancel` fires.
pub async fn run_sweeper(coordinator: UploadCoordinator, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(coordinator.limits().sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    info!(
        interval = ?coordinator.limits().sweep_interval,
        "expiry sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match coordinator.sweep_expired().await {
                    Ok(0) => debug!("no expired upload sessions"),
                    Ok(count) => info!(count, "expired upload sessions"),
                    Err(err) => warn!(error = %err, "expiry sweep failed"),
                }
            }
        }
    }

    info!("expiry sweeper stopped");
}

pub fn spawn_sweeper(coordinator: UploadCoordinator, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run_sweeper(coordinator, cancel))
}
