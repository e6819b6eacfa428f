//! Reconciles the Placement Index with what the drives actually hold.
//!
//! Writes through the union land on drives without the engine seeing them,
//! and drives come and go. A pass walks every reachable drive and brings
//! the index back in line: new files get records, changed files lose their
//! stale fingerprint, deleted files lose their record and temperature, and
//! records on unreachable drives are orphaned until the drive returns.

use crate::config::{LayoutConfig, MigrationConfig};
use crate::drives::{Drive, DriveHealth, DriveId, DriveRegistry, Tier};
use crate::index::{LogicalPath, PathLockTable, PlacementIndex, PlacementRecord, PlacementState};
use crate::migration::TaskStore;
use crate::temperature::TemperatureSampler;
use crate::union::UnionNamespace;
use crate::{Result, TierError};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub discovered: usize,
    /// Records whose file changed size or mtime outside the engine.
    pub updated: usize,
    /// Records whose file now lives on a different drive.
    pub moved: usize,
    pub removed: usize,
    pub orphaned: usize,
    pub restored: usize,
    /// Paths with a copy on more than one drive and no migration in progress.
    pub duplicates: Vec<LogicalPath>,
    pub pruned_tasks: usize,
}

#[derive(Debug, Clone)]
struct Seen {
    drive_id: DriveId,
    tier: Tier,
    size: u64,
    modified_at: i64,
}

#[derive(Clone)]
pub struct Reconciler {
    registry: DriveRegistry,
    index: PlacementIndex,
    tasks: TaskStore,
    sampler: TemperatureSampler,
    union: Arc<dyn UnionNamespace>,
    locks: PathLockTable,
}

impl Reconciler {
    /// `locks` is the executor's table; paths it holds are skipped.
    pub fn new(
        registry: DriveRegistry,
        index: PlacementIndex,
        tasks: TaskStore,
        sampler: TemperatureSampler,
        union: Arc<dyn UnionNamespace>,
        locks: PathLockTable,
    ) -> Self {
        Self {
            registry,
            index,
            tasks,
            sampler,
            union,
            locks,
        }
    }

    /// One full pass.
    ///
    /// Records are read before the walk. Index updates only apply while a
    /// record is still on the drive it was read on, so a migration that
    /// completes during the walk is never undone.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let drives = self.registry.list()?;
        let reachable: Vec<Drive> = drives
            .iter()
            .filter(|d| d.health != DriveHealth::Offline)
            .cloned()
            .collect();
        let records: HashMap<LogicalPath, PlacementRecord> = self
            .index
            .snapshot()?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let (seen, scanned) = tokio::task::spawn_blocking(move || scan(&reachable))
            .await
            .map_err(|e| TierError::Other(format!("Drive scan failed: {}", e)))?;

        let mut report = ReconcileReport {
            scanned,
            ..Default::default()
        };
        let health: HashMap<DriveId, DriveHealth> =
            drives.iter().map(|d| (d.id.clone(), d.health)).collect();
        let tasked: HashSet<LogicalPath> =
            self.tasks.active()?.into_iter().map(|t| t.path).collect();
        let busy = |path: &LogicalPath| tasked.contains(path) || self.locks.is_locked(path);

        for (path, record) in &records {
            if record.state == PlacementState::Migrating || busy(path) {
                continue;
            }
            let drive_reachable = health
                .get(&record.drive_id)
                .is_some_and(|h| *h != DriveHealth::Offline);
            let copies = seen.get(path);

            if !drive_reachable {
                if record.state == PlacementState::Stable && self.index.mark_orphaned(path)? {
                    debug!("Orphaned {} on unreachable drive {}", path, record.drive_id);
                    report.orphaned += 1;
                }
                continue;
            }

            let Some(copies) = copies else {
                if self.index.remove(path, &record.drive_id)? {
                    self.sampler.forget(path)?;
                    debug!("Removed record of deleted file {}", path);
                    report.removed += 1;
                }
                continue;
            };

            if record.state == PlacementState::Orphaned && self.index.restore(path)? {
                report.restored += 1;
            }

            match copies.iter().find(|c| c.drive_id == record.drive_id) {
                Some(copy) => {
                    let changed =
                        copy.size != record.size || copy.modified_at != record.modified_at;
                    if changed
                        && self.index.record_external_write(
                            path,
                            &record.drive_id,
                            &copy.drive_id,
                            copy.tier,
                            copy.size,
                            copy.modified_at,
                        )?
                    {
                        debug!("External write to {} detected", path);
                        report.updated += 1;
                    }
                }
                None => {
                    let copy = self.preferred(path, copies)?;
                    if self.index.record_external_write(
                        path,
                        &record.drive_id,
                        &copy.drive_id,
                        copy.tier,
                        copy.size,
                        copy.modified_at,
                    )? {
                        info!(
                            "{} moved from {} to {} outside the engine",
                            path, record.drive_id, copy.drive_id
                        );
                        report.moved += 1;
                    }
                }
            }
        }

        for (path, copies) in &seen {
            let migrating = records
                .get(path)
                .is_some_and(|r| r.state == PlacementState::Migrating);
            if copies.len() > 1 && !migrating && !busy(path) {
                report.duplicates.push(path.clone());
            }
            if records.contains_key(path) {
                continue;
            }
            let copy = self.preferred(path, copies)?;
            let record = PlacementRecord::observed(
                path.clone(),
                copy.drive_id.clone(),
                copy.tier,
                copy.size,
                copy.modified_at,
            );
            if self.index.insert_observed(&record)? {
                report.discovered += 1;
            }
        }
        for path in &report.duplicates {
            warn!("{} has copies on several drives", path);
        }

        let retention = chrono::Duration::from_std(MigrationConfig::HISTORY_RETENTION)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        report.pruned_tasks = self.tasks.prune(Utc::now() - retention)?;

        info!(
            "Reconciled {} files: {} new, {} updated, {} moved, {} removed, {} orphaned, {} restored",
            report.scanned,
            report.discovered,
            report.updated,
            report.moved,
            report.removed,
            report.orphaned,
            report.restored
        );
        Ok(report)
    }

    /// The copy the union serves, else the fastest one.
    fn preferred<'a>(&self, path: &LogicalPath, copies: &'a [Seen]) -> Result<&'a Seen> {
        let served = self.union.resolve(path)?.map(|l| l.drive_id);
        let copy = served
            .and_then(|id| copies.iter().find(|c| c.drive_id == id))
            .or_else(|| copies.iter().min_by_key(|c| (c.tier, c.drive_id.clone())));
        copy.ok_or_else(|| TierError::InconsistentPlacement {
            path: path.to_string(),
            message: "no copies seen".to_string(),
        })
    }
}

/// Walk every drive; returns the copies of each path and the file count.
fn scan(drives: &[Drive]) -> (BTreeMap<LogicalPath, Vec<Seen>>, usize) {
    let mut seen: BTreeMap<LogicalPath, Vec<Seen>> = BTreeMap::new();
    let mut scanned = 0;

    for drive in drives {
        let root = &drive.mount_path;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != LayoutConfig::INTERNAL_DIR);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = LogicalPath::from_physical(root, entry.path()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            scanned += 1;
            seen.entry(path).or_default().push(Seen {
                drive_id: drive.id.clone(),
                tier: drive.tier,
                size: meta.len(),
                modified_at,
            });
        }
    }
    (seen, scanned)
}
