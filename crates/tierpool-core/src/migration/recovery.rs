//! Startup recovery of interrupted migrations.
//!
//! Runs before the dispatcher starts. Tasks keep their persisted phase and
//! are resumed by the executor; this pass only repairs what a crash can
//! leave behind outside the task table.

use super::executor::{staged_files, staging_path, swap_state, SwapState};
use super::task::{TaskPhase, TaskStore};
use crate::drives::{DriveHealth, DriveRegistry};
use crate::index::{PlacementIndex, PlacementState};
use crate::union::UnionNamespace;
use crate::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Tasks found mid-migration, resumed from their persisted phase.
    pub resumed: Vec<String>,
    /// Swaps found already visible; these go straight to cleaning.
    pub swaps_visible: usize,
    /// Placement claims released because their task is no longer active.
    pub claims_released: usize,
    pub staging_removed: usize,
    pub pins_released: usize,
}

pub fn recover(
    tasks: &TaskStore,
    index: &PlacementIndex,
    registry: &DriveRegistry,
    union: &dyn UnionNamespace,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let active = tasks.active()?;
    let drives: HashMap<_, _> = registry
        .list()?
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect();

    for task in &active {
        match task.phase {
            TaskPhase::Planned => continue,
            TaskPhase::Verifying => {
                let staged = drives
                    .get(&task.dest)
                    .is_some_and(|d| staging_path(&d.mount_path, &task.id).is_file());
                if task.source_fingerprint.is_none() || !staged {
                    debug!("Task {} has nothing staged to verify, copying again", task.id);
                    tasks.set_phase(&task.id, TaskPhase::Copying)?;
                }
            }
            TaskPhase::Swapping => {
                if let Some(dest) = drives.get(&task.dest) {
                    if swap_state(union, task, &dest.mount_path)? == SwapState::Visible {
                        tasks.set_phase(&task.id, TaskPhase::Cleaning)?;
                        report.swaps_visible += 1;
                        debug!("Swap of {} already visible, task {} to cleaning", task.path, task.id);
                    }
                }
            }
            _ => {}
        }
        info!("Resuming task {} for {} from {}", task.id, task.path, task.phase);
        report.resumed.push(task.id.clone());
    }

    let active_ids: HashSet<&str> = active.iter().map(|t| t.id.as_str()).collect();

    for record in index.snapshot()? {
        if record.state != PlacementState::Migrating {
            continue;
        }
        let Some(task_id) = record.task_id.as_deref() else {
            continue;
        };
        if !active_ids.contains(task_id) && index.abort_migration(&record.path, task_id)? {
            warn!("Released stale migration claim on {} by task {}", record.path, task_id);
            report.claims_released += 1;
        }
    }

    for drive in drives.values() {
        if drive.health == DriveHealth::Offline {
            continue;
        }
        for staged in staged_files(&drive.mount_path) {
            let owner = staged
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if active_ids.contains(owner.as_str()) {
                continue;
            }
            match std::fs::remove_file(&staged) {
                Ok(()) => {
                    debug!("Removed leftover staging file {}", staged.display());
                    report.staging_removed += 1;
                }
                Err(e) => warn!("Failed to remove {}: {}", staged.display(), e),
            }
        }
    }

    let active_paths: HashSet<_> = active.iter().map(|t| t.path.clone()).collect();
    for (path, drive_id) in union.pins() {
        if active_paths.contains(&path) {
            continue;
        }
        let settled = match index.get(&path)? {
            Some(record) => record.drive_id == drive_id,
            None => true,
        };
        if settled {
            union.release(&path)?;
            report.pins_released += 1;
        }
    }

    if !report.resumed.is_empty() || report.staging_removed > 0 || report.claims_released > 0 {
        info!(
            "Recovery: {} tasks resumed, {} swaps already visible, {} claims released, {} staging files removed",
            report.resumed.len(),
            report.swaps_visible,
            report.claims_released,
            report.staging_removed
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::config::UnionSettings;
    use crate::drives::{Drive, DriveId, ManualCapacityProbe, Tier};
    use crate::index::{LogicalPath, PlacementRecord};
    use crate::migration::task::{MigrationReason, MigrationTask};
    use crate::store::StateStore;
    use crate::union::{Branch, BranchUnion};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_recover_repairs_leftovers() {
        let temp = TempDir::new().unwrap();
        let fast = temp.path().join("fast");
        let slow = temp.path().join("slow");
        std::fs::create_dir_all(&fast).unwrap();
        std::fs::create_dir_all(&slow).unwrap();

        let store = StateStore::open_in_memory().unwrap();
        let registry = DriveRegistry::new(store.clone(), Arc::new(ManualCapacityProbe::new()));
        registry
            .register(Drive::new("fast", fast.clone(), Tier::Fast))
            .unwrap();
        registry
            .register(Drive::new("slow", slow.clone(), Tier::Slow))
            .unwrap();
        let union = BranchUnion::open(
            UnionSettings {
                manage_mount: false,
                ..Default::default()
            },
            CommandRunner::new(true),
            temp.path().join("pins.json"),
        )
        .unwrap();
        union.set_branches(Branch::from_drives(&registry.list().unwrap()));

        let index = PlacementIndex::new(store.clone());
        let tasks = TaskStore::new(store.clone());
        let path = |p: &str| LogicalPath::new(p).unwrap();
        for p in ["swapped", "stale"] {
            std::fs::write(fast.join(p), b"x").unwrap();
            index
                .insert_observed(&PlacementRecord::observed(
                    path(p),
                    DriveId::from("fast"),
                    Tier::Fast,
                    1,
                    0,
                ))
                .unwrap();
        }

        // A task whose swap finished right before the crash.
        let swapped = tasks
            .insert_planned(vec![MigrationTask::new(
                path("swapped"),
                DriveId::from("fast"),
                DriveId::from("slow"),
                1,
                MigrationReason::Demote,
            )])
            .unwrap()
            .remove(0);
        index
            .begin_migration(&swapped.path, &swapped.id, &swapped.source)
            .unwrap();
        std::fs::write(slow.join("swapped"), b"x").unwrap();
        union
            .set_priority(&swapped.path, &DriveId::from("slow"), None)
            .await
            .unwrap();
        tasks.set_phase(&swapped.id, TaskPhase::Swapping).unwrap();

        // A claim whose task already failed, plus its staging file.
        index.begin_migration(&path("stale"), "gone-task", &DriveId::from("fast")).unwrap();
        let leftover = staging_path(&slow, "gone-task");
        std::fs::create_dir_all(leftover.parent().unwrap()).unwrap();
        std::fs::write(&leftover, b"partial").unwrap();

        let report = recover(&tasks, &index, &registry, &union).unwrap();
        assert_eq!(report.resumed, vec![swapped.id.clone()]);
        assert_eq!(report.swaps_visible, 1);
        assert_eq!(report.claims_released, 1);
        assert_eq!(report.staging_removed, 1);
        assert_eq!(report.pins_released, 0);
        assert!(!leftover.exists());
        assert_eq!(
            tasks.require(&swapped.id).unwrap().phase,
            TaskPhase::Cleaning
        );
        assert!(index.get(&path("stale")).unwrap().unwrap().is_stable());
    }

    #[tokio::test]
    async fn test_verifying_without_staged_copy_goes_back_to_copying() {
        let temp = TempDir::new().unwrap();
        let fast = temp.path().join("fast");
        let slow = temp.path().join("slow");
        std::fs::create_dir_all(&fast).unwrap();
        std::fs::create_dir_all(&slow).unwrap();

        let store = StateStore::open_in_memory().unwrap();
        let registry = DriveRegistry::new(store.clone(), Arc::new(ManualCapacityProbe::new()));
        registry
            .register(Drive::new("fast", fast.clone(), Tier::Fast))
            .unwrap();
        registry
            .register(Drive::new("slow", slow.clone(), Tier::Slow))
            .unwrap();
        let union = BranchUnion::open(
            UnionSettings {
                manage_mount: false,
                ..Default::default()
            },
            CommandRunner::new(true),
            temp.path().join("pins.json"),
        )
        .unwrap();
        union.set_branches(Branch::from_drives(&registry.list().unwrap()));

        let index = PlacementIndex::new(store.clone());
        let tasks = TaskStore::new(store.clone());
        let mut ids = Vec::new();
        for name in ["lost", "kept"] {
            let path = LogicalPath::new(name).unwrap();
            std::fs::write(fast.join(name), b"data").unwrap();
            index
                .insert_observed(&PlacementRecord::observed(
                    path.clone(),
                    DriveId::from("fast"),
                    Tier::Fast,
                    4,
                    0,
                ))
                .unwrap();
            let task = tasks
                .insert_planned(vec![MigrationTask::new(
                    path,
                    DriveId::from("fast"),
                    DriveId::from("slow"),
                    4,
                    MigrationReason::Demote,
                )])
                .unwrap()
                .remove(0);
            let fp = crate::migration::fingerprint::fingerprint_file(
                &fast.join(name),
                crate::migration::FingerprintAlgorithm::Blake3,
            )
            .unwrap();
            tasks.set_source_fingerprint(&task.id, &fp).unwrap();
            tasks.set_phase(&task.id, TaskPhase::Verifying).unwrap();
            ids.push(task.id);
        }
        let kept = staging_path(&slow, &ids[1]);
        std::fs::create_dir_all(kept.parent().unwrap()).unwrap();
        std::fs::write(&kept, b"data").unwrap();

        recover(&tasks, &index, &registry, &union).unwrap();
        assert_eq!(tasks.require(&ids[0]).unwrap().phase, TaskPhase::Copying);
        assert_eq!(tasks.require(&ids[1]).unwrap().phase, TaskPhase::Verifying);
        assert!(kept.exists());
    }
}
