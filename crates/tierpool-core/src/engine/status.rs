use super::TierEngine;
use crate::drives::{DriveHealth, DriveId, Tier};
use crate::temperature::unix_now;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Point-in-time view of one drive.
#[derive(Debug, Clone, Serialize)]
pub struct DriveStatus {
    pub id: DriveId,
    pub tier: Tier,
    pub mount_path: PathBuf,
    pub health: DriveHealth,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_ratio: f64,
    /// Bytes held for in-flight copies onto this drive.
    pub reserved_bytes: u64,
    pub indexed_files: u64,
    pub indexed_bytes: u64,
    pub temperature: f64,
    /// Whether the union currently lists the drive as a branch.
    pub in_union: bool,
}

/// Aggregate of every drive in one tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStatus {
    pub drives: usize,
    pub online: usize,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub indexed_files: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: String,
    pub dry_run: bool,
    pub drives: Vec<DriveStatus>,
    pub tiers: BTreeMap<Tier, TierStatus>,
    /// Task counts keyed by phase name.
    pub tasks: BTreeMap<String, u64>,
    /// Failed tasks awaiting the operator.
    pub failed_tasks: usize,
    pub locked_paths: usize,
    pub pinned_paths: usize,
}

impl TierEngine {
    pub fn status(&self) -> Result<EngineStatus> {
        let inner = &self.inner;
        let usage = inner.index.usage_by_drive()?;
        let temperatures = inner.sampler.snapshot(unix_now())?;
        let branches = inner.union.branches();

        let mut tiers: BTreeMap<Tier, TierStatus> = BTreeMap::new();
        let mut drives = Vec::new();
        for drive in inner.registry.list()? {
            let used = usage.get(&drive.id).copied().unwrap_or_default();
            let tier = tiers.entry(drive.tier).or_default();
            tier.drives += 1;
            if drive.is_online() {
                tier.online += 1;
            }
            tier.total_bytes += drive.total_bytes;
            tier.free_bytes += drive.free_bytes;
            tier.indexed_files += used.files;

            let used_ratio = if drive.total_bytes == 0 {
                0.0
            } else {
                drive.used_bytes() as f64 / drive.total_bytes as f64
            };
            drives.push(DriveStatus {
                reserved_bytes: inner.executor.reserved_on(&drive.id),
                temperature: temperatures.drive(&drive.id),
                in_union: branches.iter().any(|b| b.drive_id == drive.id),
                indexed_files: used.files,
                indexed_bytes: used.bytes,
                used_ratio,
                id: drive.id,
                tier: drive.tier,
                mount_path: drive.mount_path,
                health: drive.health,
                total_bytes: drive.total_bytes,
                free_bytes: drive.free_bytes,
            });
        }

        let tasks = inner
            .tasks
            .phase_counts()?
            .into_iter()
            .map(|(phase, count)| (phase.as_str().to_string(), count))
            .collect();

        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            dry_run: inner.config.dry_run,
            drives,
            tiers,
            tasks,
            failed_tasks: inner.tasks.failed()?.len(),
            locked_paths: inner.executor.locks().len(),
            pinned_paths: inner.union.pins().len(),
        })
    }
}
