//! Operator-facing methods on TierEngine.

use super::TierEngine;
use crate::drives::{Drive, DriveHealth, DriveId};
use crate::index::LogicalPath;
use crate::maintenance::ReconcileReport;
use crate::migration::{MigrationTask, TaskOutcome};
use crate::policy::{FlaggedPath, PlannedMove, PolicyInput, Rejection};
use crate::temperature::{unix_now, SampleReport};
use crate::union::PhysicalLocation;
use crate::Result;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What one policy cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Tasks actually queued; a move whose path gained a task meanwhile is
    /// dropped.
    pub queued: Vec<MigrationTask>,
    pub planned: Vec<PlannedMove>,
    pub rejections: Vec<Rejection>,
    pub flagged: Vec<FlaggedPath>,
}

impl TierEngine {
    // ========================================
    // Drives
    // ========================================

    pub fn list_drives(&self) -> Result<Vec<Drive>> {
        self.inner.registry.list()
    }

    /// Re-probe one drive and update the union's branches.
    pub fn refresh_capacity(&self, id: &DriveId) -> Result<Drive> {
        let outcome = self.inner.registry.refresh_capacity(id);
        self.sync_branches()?;
        outcome
    }

    /// Re-probe every drive. Per-drive failures are logged; the drive is
    /// already marked offline by the registry.
    pub fn refresh_all_capacity(&self) -> Result<Vec<Drive>> {
        let mut refreshed = Vec::new();
        for (id, outcome) in self.inner.registry.refresh_all()? {
            match outcome {
                Ok(drive) => refreshed.push(drive),
                Err(e) => warn!("Capacity refresh of {} failed: {}", id, e),
            }
        }
        self.sync_branches()?;
        Ok(refreshed)
    }

    /// Remove a drive. Fails with `DriveBusy` while any pending task uses
    /// it. Records still placed on the drive become orphaned.
    pub fn deregister_drive(&self, id: &DriveId) -> Result<()> {
        self.inner.registry.deregister(id)?;
        let mut orphaned = 0;
        for record in self.inner.index.on_drive(id)? {
            if self.inner.index.mark_orphaned(&record.path)? {
                orphaned += 1;
            }
        }
        self.sync_branches()?;
        info!("Deregistered drive {} ({} records orphaned)", id, orphaned);
        Ok(())
    }

    pub fn set_drive_health(&self, id: &DriveId, health: DriveHealth) -> Result<Drive> {
        let drive = self.inner.registry.set_health(id, health)?;
        self.sync_branches()?;
        info!("Drive {} marked {}", id, health.as_str());
        Ok(drive)
    }

    // ========================================
    // Tasks
    // ========================================

    pub fn list_tasks(&self) -> Result<Vec<MigrationTask>> {
        self.inner.tasks.list()
    }

    /// Failed tasks the operator has not dismissed.
    pub fn list_failed_tasks(&self) -> Result<Vec<MigrationTask>> {
        self.inner.tasks.failed()
    }

    /// Re-arm a failed task with a fresh attempt budget.
    pub fn retry_task(&self, id: &str) -> Result<MigrationTask> {
        let task = self.inner.tasks.retry(id)?;
        info!("Task {} for {} re-armed by operator", task.id, task.path);
        Ok(task)
    }

    /// Hide a failed task and unblock its path for planning.
    pub fn dismiss_task(&self, id: &str) -> Result<MigrationTask> {
        let task = self.inner.tasks.dismiss(id)?;
        info!("Task {} for {} dismissed", task.id, task.path);
        Ok(task)
    }

    /// Run every due task until the queue settles. Used by one-shot runs and
    /// tests; the started engine dispatches on its own.
    pub async fn run_migrations(&self, max_rounds: usize) -> Result<Vec<(String, TaskOutcome)>> {
        self.inner
            .dispatcher
            .drain(&self.inner.cancel, max_rounds)
            .await
    }

    // ========================================
    // Cycles
    // ========================================

    /// Plan from one consistent snapshot and queue the resulting moves.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.inner.cycle_lock.lock().await;

        let input = PolicyInput {
            drives: self.inner.registry.list()?,
            temperatures: self.inner.sampler.snapshot(unix_now())?,
            placements: self.inner.index.snapshot()?,
            blocked: self
                .inner
                .tasks
                .blocked_paths()?
                .into_iter()
                .collect::<HashSet<_>>(),
        };
        let plan = self.inner.policy.plan(&input);

        for rejection in &plan.rejections {
            debug!("Not placing {}: {}", rejection.path, rejection.to_error());
        }
        for flagged in &plan.flagged {
            warn!("Skipping {}: {:?}", flagged.path, flagged.reason);
        }

        let tasks: Vec<MigrationTask> = plan.moves.iter().cloned().map(|m| m.into_task()).collect();
        let queued = self.inner.tasks.insert_planned(tasks)?;
        info!(
            "Policy cycle: {} planned, {} queued, {} rejected, {} flagged",
            plan.moves.len(),
            queued.len(),
            plan.rejections.len(),
            plan.flagged.len()
        );

        Ok(CycleReport {
            queued,
            planned: plan.moves,
            rejections: plan.rejections,
            flagged: plan.flagged,
        })
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.inner.reconciler.reconcile().await
    }

    pub async fn sample_now(&self) -> Result<SampleReport> {
        self.inner.sampler.sample_once().await
    }

    /// Where the union currently serves `path` from.
    pub fn resolve(&self, path: &str) -> Result<Option<PhysicalLocation>> {
        let path = LogicalPath::new(path)?;
        self.inner.union.resolve(&path)
    }
}
