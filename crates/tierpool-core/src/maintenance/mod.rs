//! Periodic maintenance: index reconciliation and history pruning.

mod reconcile;
mod watcher;

pub use reconcile::{ReconcileReport, Reconciler};
pub use watcher::DriveWatcher;

use crate::cancel::CancellationToken;
use crate::config::IntervalConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Reconcile every `interval`, or early when `trigger` fires. After a
/// failed pass the next one comes sooner.
pub async fn run_maintenance(
    reconciler: Reconciler,
    interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    info!("Maintenance loop started (interval {:?})", interval);
    loop {
        let wait = match reconciler.reconcile().await {
            Ok(_) => interval,
            Err(e) => {
                warn!("Reconcile failed: {}", e);
                interval.min(IntervalConfig::MAINTENANCE_AFTER_ERROR)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = trigger.notified() => {}
            _ = cancel.cancelled() => break,
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    info!("Maintenance loop stopped");
}
