//! `mergerfs`-style union over drive roots with a durable pin table.

use super::{Branch, PhysicalLocation, UnionNamespace};
use crate::atomic::{atomic_read_json, atomic_write_json, sync_dir};
use crate::command::{args, CommandRunner};
use crate::config::UnionSettings;
use crate::drives::DriveId;
use crate::index::LogicalPath;
use crate::{Result, TierError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct UnionState {
    branches: Vec<Branch>,
    /// Logical path → drive whose copy is served.
    pins: BTreeMap<String, DriveId>,
    /// Mount points this process mounted, in mount order.
    mounted: Vec<PathBuf>,
}

/// One mergerfs invocation.
#[derive(Debug, Clone, PartialEq)]
struct PoolMount {
    mount_point: PathBuf,
    create_policy: String,
    branches: Vec<Branch>,
}

/// Branches are ordered fastest first, so a first-found create policy puts
/// new files on the fast tier. While a migration has two copies of a path,
/// the pin decides which one [`resolve`](UnionNamespace::resolve) reports.
pub struct BranchUnion {
    settings: UnionSettings,
    runner: CommandRunner,
    pins_path: PathBuf,
    state: Mutex<UnionState>,
}

impl BranchUnion {
    /// Load the pin table from `pins_path` (empty when absent).
    pub fn open(settings: UnionSettings, runner: CommandRunner, pins_path: PathBuf) -> Result<Self> {
        let pins: BTreeMap<String, DriveId> = atomic_read_json(&pins_path)?.unwrap_or_default();
        if !pins.is_empty() {
            debug!("Loaded {} union pins from {}", pins.len(), pins_path.display());
        }
        Ok(Self {
            settings,
            runner,
            pins_path,
            state: Mutex::new(UnionState {
                pins,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, UnionState>> {
        self.state
            .lock()
            .map_err(|_| TierError::Other("union state poisoned".to_string()))
    }

    /// Pinned drive for a path, if any.
    pub fn pin(&self, path: &LogicalPath) -> Option<DriveId> {
        self.lock().ok()?.pins.get(path.as_str()).cloned()
    }

    fn persist_pins(&self, pins: &BTreeMap<String, DriveId>) -> Result<()> {
        atomic_write_json(&self.pins_path, pins, true)
    }

    /// The mounts for `branches`: one per configured pool that has
    /// branches, or a single pool at the mount point.
    fn pool_mounts(&self, branches: &[Branch]) -> Vec<PoolMount> {
        let settings = &self.settings;
        if settings.pools.is_empty() {
            return vec![PoolMount {
                mount_point: settings.mount_point.clone(),
                create_policy: settings.create_policy.clone(),
                branches: branches.to_vec(),
            }];
        }

        settings
            .pools
            .iter()
            .filter_map(|pool| {
                let members: Vec<Branch> = branches
                    .iter()
                    .filter(|b| b.tier >= pool.min_tier)
                    .cloned()
                    .collect();
                if members.is_empty() {
                    debug!("Pool {} has no drives, not mounting it", pool.name);
                    return None;
                }
                Some(PoolMount {
                    mount_point: settings.mount_point.join(&pool.name),
                    create_policy: pool.create_policy.clone(),
                    branches: members,
                })
            })
            .collect()
    }

    fn mergerfs_args(&self, pool: &PoolMount) -> Vec<String> {
        let mut options = self.settings.options.clone();
        options.push(format!("category.create={}", pool.create_policy));
        let glob = pool
            .branches
            .iter()
            .map(|b| b.root.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(":");
        vec![
            "-o".to_string(),
            options.join(","),
            glob,
            pool.mount_point.to_string_lossy().to_string(),
        ]
    }

    /// Points mounted by the last [`mount`](UnionNamespace::mount).
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.lock().map(|s| s.mounted.clone()).unwrap_or_default()
    }
}

fn holds(root: &Path, path: &LogicalPath) -> bool {
    std::fs::symlink_metadata(path.on_drive(root))
        .map(|m| !m.is_dir())
        .unwrap_or(false)
}

#[async_trait]
impl UnionNamespace for BranchUnion {
    fn resolve(&self, path: &LogicalPath) -> Result<Option<PhysicalLocation>> {
        let state = self.lock()?;

        if let Some(pinned) = state.pins.get(path.as_str()) {
            if let Some(branch) = state.branches.iter().find(|b| &b.drive_id == pinned) {
                if holds(&branch.root, path) {
                    return Ok(Some(PhysicalLocation {
                        drive_id: branch.drive_id.clone(),
                        path: path.on_drive(&branch.root),
                    }));
                }
            }
        }

        Ok(state
            .branches
            .iter()
            .find(|b| holds(&b.root, path))
            .map(|b| PhysicalLocation {
                drive_id: b.drive_id.clone(),
                path: path.on_drive(&b.root),
            }))
    }

    async fn set_priority(
        &self,
        path: &LogicalPath,
        drive: &DriveId,
        staged: Option<&Path>,
    ) -> Result<PhysicalLocation> {
        let root = {
            let state = self.lock()?;
            state
                .branches
                .iter()
                .find(|b| &b.drive_id == drive)
                .map(|b| b.root.clone())
                .ok_or_else(|| TierError::DriveNotFound(drive.to_string()))?
        };
        let target = path.on_drive(&root);

        match staged {
            Some(staged) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| TierError::io_with_path(e, parent))?;
                }
                std::fs::rename(staged, &target).map_err(|e| TierError::Io {
                    message: format!(
                        "Failed to move {} into place at {}",
                        staged.display(),
                        target.display()
                    ),
                    path: Some(target.clone()),
                    source: Some(e),
                })?;
                if let Some(parent) = target.parent() {
                    sync_dir(parent);
                }
            }
            None if !holds(&root, path) => {
                return Err(TierError::InconsistentPlacement {
                    path: path.to_string(),
                    message: format!("no copy on {} to switch to", drive),
                });
            }
            None => {}
        }

        let mut state = self.lock()?;
        let previous = state.pins.insert(path.to_string(), drive.clone());
        if let Err(e) = self.persist_pins(&state.pins) {
            match previous {
                Some(prev) => state.pins.insert(path.to_string(), prev),
                None => state.pins.remove(path.as_str()),
            };
            return Err(e);
        }
        debug!("Pinned {} to {}", path, drive);

        Ok(PhysicalLocation {
            drive_id: drive.clone(),
            path: target,
        })
    }

    fn release(&self, path: &LogicalPath) -> Result<()> {
        let mut state = self.lock()?;
        if state.pins.remove(path.as_str()).is_some() {
            self.persist_pins(&state.pins)?;
        }
        Ok(())
    }

    async fn mount(&self, branches: Vec<Branch>) -> Result<()> {
        let was_mounted = {
            let mut state = self.lock()?;
            state.branches = branches.clone();
            !state.mounted.is_empty()
        };

        if !self.settings.manage_mount {
            info!(
                "Union mount management disabled, tracking {} branches",
                branches.len()
            );
            return Ok(());
        }
        if branches.is_empty() {
            return Err(TierError::Validation {
                field: "union".to_string(),
                message: "no branches to mount".to_string(),
            });
        }
        if was_mounted {
            self.unmount().await?;
        }

        for pool in self.pool_mounts(&branches) {
            let mount_point = &pool.mount_point;
            if !self.runner.is_dry_run() {
                std::fs::create_dir_all(mount_point)
                    .map_err(|e| TierError::io_with_path(e, mount_point))?;
            }
            self.runner
                .run("mergerfs", &self.mergerfs_args(&pool))
                .await?;
            self.lock()?.mounted.push(mount_point.clone());
            info!(
                "Mounted union of {} branches at {} (create {})",
                pool.branches.len(),
                mount_point.display(),
                pool.create_policy
            );
        }
        Ok(())
    }

    /// Unmounts every mounted pool, last first. Pools that fail to unmount
    /// stay recorded; the first failure is returned.
    async fn unmount(&self) -> Result<()> {
        if !self.settings.manage_mount {
            return Ok(());
        }
        let mounted = self.lock()?.mounted.clone();
        let mut first_error = None;
        for mount_point in mounted.iter().rev() {
            let target = mount_point.to_string_lossy().to_string();
            match self.runner.run("fusermount", &args(["-u", &target])).await {
                Ok(_) => {
                    self.lock()?.mounted.retain(|m| m != mount_point);
                    info!("Unmounted union at {}", target);
                }
                Err(e) => {
                    warn!("Failed to unmount union at {}: {}", target, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_branches(&self, branches: Vec<Branch>) {
        if let Ok(mut state) = self.lock() {
            state.branches = branches;
        }
    }

    fn branches(&self) -> Vec<Branch> {
        self.lock().map(|s| s.branches.clone()).unwrap_or_default()
    }

    fn pins(&self) -> Vec<(LogicalPath, DriveId)> {
        self.lock()
            .map(|s| {
                s.pins
                    .iter()
                    .filter_map(|(path, drive)| {
                        LogicalPath::new(path).ok().map(|p| (p, drive.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
