//! Migration Executor: drives one task through its phases.
//!
//! Each phase is persisted before its work starts, and every phase can be
//! re-run after a crash: the staging path is derived from the task id, the
//! copy resumes or restarts, and the swap checks what the union already
//! shows before acting. The source file is only removed once the union
//! serves the verified destination copy.

use super::copy::CopyPrimitive;
use super::fingerprint::{Fingerprint, Fingerprinter};
use super::task::{FailureKind, MigrationTask, TaskPhase, TaskStore};
use crate::cancel::CancellationToken;
use crate::config::{LayoutConfig, MigrationSettings};
use crate::drives::{Drive, DriveHealth, DriveId, DriveRegistry};
use crate::index::{complete_migration_in, PathLockTable, PlacementIndex};
use crate::retry::BackoffPolicy;
use crate::store::StateStore;
use crate::union::UnionNamespace;
use crate::{Result, TierError};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a task builds its copy on the destination drive.
pub fn staging_path(drive_root: &Path, task_id: &str) -> PathBuf {
    staging_dir(drive_root).join(task_id)
}

pub fn staging_dir(drive_root: &Path) -> PathBuf {
    drive_root
        .join(LayoutConfig::INTERNAL_DIR)
        .join(LayoutConfig::STAGING_DIR)
}

/// Result of one [`MigrationExecutor::execute`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "failure")]
pub enum TaskOutcome {
    Done,
    /// Back to planned without spending an attempt.
    Requeued,
    /// Past the swap point; will be retried in place.
    Deferred,
    Failed(FailureKind),
    /// Shutdown requested; the persisted phase is resumed later.
    Interrupted,
    /// Already terminal.
    Skipped,
}

/// What the union and the destination drive show for a task past its copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwapState {
    /// The staged copy is still waiting to be moved into place.
    Staged,
    /// The union already serves the destination copy.
    Visible,
    /// The destination copy is in place but not yet served.
    Placed,
    /// Neither a staged nor a placed copy exists.
    Missing,
}

pub(crate) fn swap_state(
    union: &dyn UnionNamespace,
    task: &MigrationTask,
    dest_root: &Path,
) -> Result<SwapState> {
    if staging_path(dest_root, &task.id).exists() {
        return Ok(SwapState::Staged);
    }
    if let Some(location) = union.resolve(&task.path)? {
        if location.drive_id == task.dest {
            return Ok(SwapState::Visible);
        }
    }
    if task.path.on_drive(dest_root).is_file() {
        return Ok(SwapState::Placed);
    }
    Ok(SwapState::Missing)
}

/// Bytes promised to in-flight copies, per destination drive.
#[derive(Debug, Clone, Default)]
struct Reservations {
    held: Arc<Mutex<HashMap<String, (DriveId, u64)>>>,
}

impl Reservations {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (DriveId, u64)>>> {
        self.held
            .lock()
            .map_err(|_| TierError::Other("reservation table poisoned".to_string()))
    }

    /// Reserve `size` on `drive` if `free` minus what is already reserved
    /// covers it plus `keep_free`. Err carries the bytes that were available.
    fn try_reserve(
        &self,
        task_id: &str,
        drive: &DriveId,
        size: u64,
        free: u64,
        keep_free: u64,
    ) -> Result<std::result::Result<Reservation, u64>> {
        let mut held = self.lock()?;
        let reserved: u64 = held
            .iter()
            .filter(|(id, (d, _))| d == drive && id.as_str() != task_id)
            .map(|(_, (_, bytes))| *bytes)
            .sum();
        let available = free.saturating_sub(reserved).saturating_sub(keep_free);
        if available < size {
            return Ok(Err(available));
        }
        held.insert(task_id.to_string(), (drive.clone(), size));
        Ok(Ok(Reservation {
            held: Arc::clone(&self.held),
            task_id: task_id.to_string(),
        }))
    }

    fn hold(&self, task_id: &str, drive: &DriveId, size: u64) -> Result<Reservation> {
        self.lock()?
            .insert(task_id.to_string(), (drive.clone(), size));
        Ok(Reservation {
            held: Arc::clone(&self.held),
            task_id: task_id.to_string(),
        })
    }

    fn total_on(&self, drive: &DriveId) -> u64 {
        self.lock()
            .map(|held| {
                held.values()
                    .filter(|(d, _)| d == drive)
                    .map(|(_, bytes)| *bytes)
                    .sum()
            })
            .unwrap_or(0)
    }
}

struct Reservation {
    held: Arc<Mutex<HashMap<String, (DriveId, u64)>>>,
    task_id: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.task_id);
        }
    }
}

/// Runs migration tasks. Cheap to clone; clones share locks and
/// reservations.
#[derive(Clone)]
pub struct MigrationExecutor {
    store: StateStore,
    tasks: TaskStore,
    index: PlacementIndex,
    registry: DriveRegistry,
    union: Arc<dyn UnionNamespace>,
    copier: Arc<dyn CopyPrimitive>,
    fingerprinter: Arc<dyn Fingerprinter>,
    locks: PathLockTable,
    backoff: BackoffPolicy,
    reserve_bytes: u64,
    lock_retry: Duration,
    reservations: Reservations,
}

impl MigrationExecutor {
    pub fn new(
        store: StateStore,
        registry: DriveRegistry,
        union: Arc<dyn UnionNamespace>,
        copier: Arc<dyn CopyPrimitive>,
        fingerprinter: Arc<dyn Fingerprinter>,
        settings: &MigrationSettings,
    ) -> Self {
        Self {
            tasks: TaskStore::new(store.clone()),
            index: PlacementIndex::new(store.clone()),
            store,
            registry,
            union,
            copier,
            fingerprinter,
            locks: PathLockTable::new(),
            backoff: BackoffPolicy::from_settings(settings),
            reserve_bytes: settings.reserve_bytes,
            lock_retry: Duration::from_secs(settings.lock_retry_secs),
            reservations: Reservations::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn locks(&self) -> &PathLockTable {
        &self.locks
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Bytes currently reserved on a drive by in-flight copies.
    pub fn reserved_on(&self, drive: &DriveId) -> u64 {
        self.reservations.total_on(drive)
    }

    /// Advance a task from its persisted phase as far as it goes.
    ///
    /// Faults are recorded on the task; only store failures are returned.
    pub async fn execute(&self, task_id: &str, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let task = self.tasks.require(task_id)?;
        if task.phase.is_terminal() {
            return Ok(TaskOutcome::Skipped);
        }
        if cancel.is_cancelled() {
            return Ok(TaskOutcome::Interrupted);
        }

        let _guard = match self.locks.try_lock(&task.path) {
            Ok(guard) => guard,
            Err(TierError::PathLocked { path }) => {
                let not_before = Utc::now().timestamp() + self.lock_retry.as_secs() as i64;
                debug!("Path {} is locked, task {} retries at {}", path, task.id, not_before);
                if task.phase == TaskPhase::Planned {
                    self.tasks.requeue(&task.id, not_before, "path locked")?;
                } else {
                    self.tasks.defer(&task.id, not_before, "path locked")?;
                }
                return Ok(TaskOutcome::Requeued);
            }
            Err(e) => return Err(e),
        };

        let result = match self.reserve(&task) {
            Ok(Some(reservation)) => {
                let outcome = self.advance(&task, cancel).await;
                drop(reservation);
                outcome
            }
            Ok(None) => return Ok(TaskOutcome::Requeued),
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(TierError::Cancelled) => {
                info!("Task {} for {} paused for shutdown", task.id, task.path);
                Ok(TaskOutcome::Interrupted)
            }
            Err(e) => self.record_failure(task_id, e),
        }
    }

    /// Capacity re-check for planned tasks; copies already under way keep
    /// their earlier claim.
    fn reserve(&self, task: &MigrationTask) -> Result<Option<Reservation>> {
        let dest = self.registry.require(&task.dest)?;
        if task.phase != TaskPhase::Planned {
            return self.reservations.hold(&task.id, &dest.id, task.size).map(Some);
        }
        if !dest.is_online() {
            return Err(TierError::DriveUnreachable {
                drive_id: dest.id.to_string(),
                message: format!("drive is {}", dest.health),
            });
        }

        let free = self.registry.probe_free_bytes(&dest)?;
        match self
            .reservations
            .try_reserve(&task.id, &dest.id, task.size, free, self.reserve_bytes)?
        {
            Ok(reservation) => Ok(Some(reservation)),
            Err(available) => {
                let err = TierError::CapacityExceeded {
                    drive_id: dest.id.to_string(),
                    needed: task.size,
                    available,
                };
                let not_before = self
                    .backoff
                    .next_attempt_at(task.attempts.max(1), Utc::now())
                    .timestamp();
                info!("Requeueing task {} for {}: {}", task.id, task.path, err);
                self.tasks.requeue(&task.id, not_before, &err.to_string())?;
                Ok(None)
            }
        }
    }

    async fn advance(&self, task: &MigrationTask, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let source = self.usable_drive(&task.source)?;
        let dest = self.usable_drive(&task.dest)?;
        let source_file = task.path.on_drive(&source.mount_path);
        let staged = staging_path(&dest.mount_path, &task.id);

        let mut fingerprint = task.source_fingerprint.clone();
        let mut phase = task.phase;
        loop {
            cancel.check()?;
            phase = match phase {
                TaskPhase::Planned => self.enter(task, TaskPhase::Copying)?,
                TaskPhase::Copying => {
                    fingerprint = Some(self.copy_to_staging(task, &source_file, &staged).await?);
                    self.enter(task, TaskPhase::Verifying)?
                }
                TaskPhase::Verifying => match &fingerprint {
                    Some(expected) => {
                        self.verify(task, &staged, expected).await?;
                        self.enter(task, TaskPhase::Swapping)?
                    }
                    None => self.enter(task, TaskPhase::Copying)?,
                },
                TaskPhase::Swapping => {
                    let next = self.swap(task, &dest, &staged).await?;
                    self.enter(task, next)?
                }
                TaskPhase::Cleaning => {
                    let fingerprint = match fingerprint.take() {
                        Some(fp) => fp,
                        None => {
                            self.fingerprinter
                                .fingerprint(&task.path.on_drive(&dest.mount_path))
                                .await?
                        }
                    };
                    self.clean(task, &source, &dest, &source_file, &fingerprint)
                        .await?;
                    self.finish(task, &dest, &fingerprint)?;
                    return Ok(TaskOutcome::Done);
                }
                TaskPhase::Done | TaskPhase::Failed => return Ok(TaskOutcome::Skipped),
            };
        }
    }

    fn usable_drive(&self, id: &DriveId) -> Result<Drive> {
        let drive = self.registry.require(id)?;
        if drive.health == DriveHealth::Offline {
            return Err(TierError::DriveUnreachable {
                drive_id: id.to_string(),
                message: "drive is offline".to_string(),
            });
        }
        Ok(drive)
    }

    fn enter(&self, task: &MigrationTask, phase: TaskPhase) -> Result<TaskPhase> {
        self.tasks.set_phase(&task.id, phase)?;
        info!("Task {} ({}): {}", task.id, task.path, phase);
        Ok(phase)
    }

    async fn copy_to_staging(
        &self,
        task: &MigrationTask,
        source_file: &Path,
        staged: &Path,
    ) -> Result<Fingerprint> {
        let vanished = || TierError::InconsistentPlacement {
            path: task.path.to_string(),
            message: format!("source {} vanished", source_file.display()),
        };
        if !source_file.is_file() {
            return Err(vanished());
        }

        let fingerprint = match self.fingerprinter.fingerprint(source_file).await {
            Ok(fp) => fp,
            Err(e) if e.is_not_found() => return Err(vanished()),
            Err(e) => return Err(e),
        };
        self.tasks.set_source_fingerprint(&task.id, &fingerprint)?;
        self.index
            .begin_migration(&task.path, &task.id, &task.source)?;

        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TierError::io_with_path(e, parent))?;
        }
        let bytes = match self.copier.copy(source_file, staged).await {
            Ok(bytes) => bytes,
            Err(e) if !source_file.exists() => {
                debug!("Copy of {} failed after source vanished: {}", task.path, e);
                return Err(vanished());
            }
            Err(e) => return Err(e),
        };
        debug!("Staged {} bytes of {} at {}", bytes, task.path, staged.display());
        Ok(fingerprint)
    }

    async fn verify(&self, task: &MigrationTask, staged: &Path, expected: &Fingerprint) -> Result<()> {
        let actual = self.fingerprinter.fingerprint(staged).await?;
        if &actual == expected {
            debug!("Verified staged copy of {}", task.path);
            return Ok(());
        }

        let err = TierError::VerificationFailed {
            path: task.path.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        };
        error!("Task {}: {}", task.id, err);
        remove_if_exists(staged)?;
        Err(err)
    }

    async fn swap(&self, task: &MigrationTask, dest: &Drive, staged: &Path) -> Result<TaskPhase> {
        match swap_state(self.union.as_ref(), task, &dest.mount_path)? {
            SwapState::Staged => {
                self.union
                    .set_priority(&task.path, &dest.id, Some(staged))
                    .await?;
            }
            SwapState::Visible => {
                debug!("Swap of {} to {} already visible", task.path, dest.id);
            }
            SwapState::Placed => {
                self.union.set_priority(&task.path, &dest.id, None).await?;
            }
            SwapState::Missing => {
                warn!(
                    "Task {}: no staged or placed copy of {} on {}, copying again",
                    task.id, task.path, dest.id
                );
                return Ok(TaskPhase::Copying);
            }
        }
        Ok(TaskPhase::Cleaning)
    }

    /// Remove the source once the union serves the destination and the
    /// source still holds the bytes that were copied.
    async fn clean(
        &self,
        task: &MigrationTask,
        source: &Drive,
        dest: &Drive,
        source_file: &Path,
        copied: &Fingerprint,
    ) -> Result<()> {
        let served = self.union.resolve(&task.path)?;
        if served.as_ref().map(|l| &l.drive_id) != Some(&task.dest) {
            return Err(TierError::InconsistentPlacement {
                path: task.path.to_string(),
                message: format!(
                    "refusing to remove source, union serves {:?}",
                    served.map(|l| l.drive_id.to_string())
                ),
            });
        }

        let current = match self.fingerprinter.fingerprint(source_file).await {
            Ok(fp) => Some(fp),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(current) = current {
            if &current != copied {
                return Err(self.roll_back(task, dest, copied, &current).await);
            }
        }

        remove_if_exists(source_file)?;
        prune_empty_parents(source_file, &source.mount_path);
        Ok(())
    }

    /// Undo a swap whose source was written to after the copy: drop the
    /// destination copy and the pin so the union serves the source again.
    async fn roll_back(
        &self,
        task: &MigrationTask,
        dest: &Drive,
        copied: &Fingerprint,
        current: &Fingerprint,
    ) -> TierError {
        let placed = task.path.on_drive(&dest.mount_path);
        match self.fingerprinter.fingerprint(&placed).await {
            Ok(fp) if &fp != copied => {
                return TierError::InconsistentPlacement {
                    path: task.path.to_string(),
                    message: format!(
                        "source and destination both changed during migration ({} and {})",
                        current, fp
                    ),
                };
            }
            Err(e) if !e.is_not_found() => return e,
            _ => {}
        }

        if let Err(e) = remove_if_exists(&placed) {
            return e;
        }
        prune_empty_parents(&placed, &dest.mount_path);
        if let Err(e) = self.union.release(&task.path) {
            return e;
        }
        warn!(
            "Task {}: {} was written to during migration, destination copy on {} discarded",
            task.id, task.path, dest.id
        );
        TierError::SourceChanged {
            path: task.path.to_string(),
            message: format!("copied {}, now {}", copied, current),
        }
    }

    fn finish(&self, task: &MigrationTask, dest: &Drive, fingerprint: &Fingerprint) -> Result<()> {
        self.store.transaction(|tx| {
            complete_migration_in(tx, &task.path, &task.id, &dest.id, dest.tier, fingerprint)?;
            super::task::set_phase_in(tx, &task.id, TaskPhase::Done)
        })?;
        if let Err(e) = self.union.release(&task.path) {
            warn!("Failed to release union pin for {}: {}", task.path, e);
        }
        info!(
            "Migrated {} from {} to {} ({} bytes)",
            task.path, task.source, task.dest, task.size
        );
        Ok(())
    }

    fn record_failure(&self, task_id: &str, err: TierError) -> Result<TaskOutcome> {
        let task = self.tasks.require(task_id)?;
        let message = err.to_string();
        let now = Utc::now();

        let past_swap = matches!(task.phase, TaskPhase::Swapping | TaskPhase::Cleaning);
        if past_swap && !matches!(err, TierError::SourceChanged { .. }) {
            let not_before = self
                .backoff
                .next_attempt_at(task.attempts.max(1), now)
                .timestamp();
            warn!(
                "Task {} stalled in {} for {}: {}",
                task.id, task.phase, task.path, message
            );
            self.tasks.defer(&task.id, not_before, &message)?;
            return Ok(TaskOutcome::Deferred);
        }

        if let Ok(Some(dest)) = self.registry.get(&task.dest) {
            let staged = staging_path(&dest.mount_path, &task.id);
            if let Err(e) = remove_if_exists(&staged) {
                warn!("Failed to discard staged copy {}: {}", staged.display(), e);
            }
        }
        self.index.abort_migration(&task.path, &task.id)?;

        let attempts = task.attempts + 1;
        let kind = if matches!(
            err,
            TierError::InconsistentPlacement { .. } | TierError::DriveNotFound(_)
        ) {
            FailureKind::Abandoned
        } else if self.backoff.is_exhausted(attempts) {
            FailureKind::Exhausted
        } else {
            FailureKind::Retryable
        };
        let not_before = self.backoff.next_attempt_at(attempts, now).timestamp();

        match kind {
            FailureKind::Exhausted => error!(
                "{}",
                TierError::MigrationExhausted {
                    path: task.path.to_string(),
                    attempts,
                    last_error: message.clone(),
                }
            ),
            FailureKind::Abandoned => warn!("Abandoned task {}: {}", task.id, message),
            FailureKind::Retryable => warn!(
                "Task {} attempt {}/{} failed, retrying after {}: {}",
                task.id, attempts, self.backoff.max_attempts, not_before, message
            ),
        }
        self.tasks.fail(&task.id, kind, attempts, not_before, &message)?;
        Ok(TaskOutcome::Failed(kind))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TierError::io_with_path(e, path)),
    }
}

/// Remove now-empty directories between `file` and `root`, exclusive.
fn prune_empty_parents(file: &Path, root: &Path) {
    let mut dir = file.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

/// Files in a drive's staging area.
pub(crate) fn staged_files(drive_root: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(staging_dir(drive_root))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::config::UnionSettings;
    use crate::drives::{ManualCapacityProbe, Tier};
    use crate::index::{LogicalPath, PlacementRecord, PlacementState};
    use crate::migration::copy::NativeCopier;
    use crate::migration::fingerprint::{FingerprintAlgorithm, StreamingFingerprinter};
    use crate::migration::task::MigrationReason;
    use crate::union::{Branch, BranchUnion};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        fast: PathBuf,
        slow: PathBuf,
        probe: Arc<ManualCapacityProbe>,
        store: StateStore,
        union: Arc<BranchUnion>,
        registry: DriveRegistry,
        index: PlacementIndex,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let fast = temp.path().join("fast");
        let slow = temp.path().join("slow");
        std::fs::create_dir_all(&fast).unwrap();
        std::fs::create_dir_all(&slow).unwrap();

        let probe = Arc::new(ManualCapacityProbe::new());
        probe.set(&fast, 1_000_000, 500_000);
        probe.set(&slow, 10_000_000, 9_000_000);

        let store = StateStore::open_in_memory().unwrap();
        let registry = DriveRegistry::new(store.clone(), probe.clone());
        registry
            .register(Drive::new(DriveId::from("fast"), fast.clone(), Tier::Fast))
            .unwrap();
        registry
            .register(Drive::new(DriveId::from("slow"), slow.clone(), Tier::Slow))
            .unwrap();
        registry.refresh_all().unwrap();

        let union = Arc::new(
            BranchUnion::open(
                UnionSettings {
                    manage_mount: false,
                    ..Default::default()
                },
                CommandRunner::new(true),
                temp.path().join("pins.json"),
            )
            .unwrap(),
        );
        union.set_branches(Branch::from_drives(&registry.list().unwrap()));

        Harness {
            index: PlacementIndex::new(store.clone()),
            _temp: temp,
            fast,
            slow,
            probe,
            store,
            union,
            registry,
        }
    }

    impl Harness {
        fn executor_with(&self, copier: Arc<dyn CopyPrimitive>) -> MigrationExecutor {
            let settings = MigrationSettings {
                reserve_bytes: 0,
                ..Default::default()
            };
            MigrationExecutor::new(
                self.store.clone(),
                self.registry.clone(),
                self.union.clone(),
                copier,
                Arc::new(StreamingFingerprinter::new(FingerprintAlgorithm::Blake3)),
                &settings,
            )
            .with_backoff(BackoffPolicy::from_settings(&settings).with_jitter(false))
        }

        fn executor(&self) -> MigrationExecutor {
            self.executor_with(Arc::new(NativeCopier::new()))
        }

        fn place(&self, path: &str, content: &[u8]) -> MigrationTask {
            let file = self.fast.join(path);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(&file, content).unwrap();
            let path = LogicalPath::new(path).unwrap();
            self.index
                .insert_observed(&PlacementRecord::observed(
                    path.clone(),
                    DriveId::from("fast"),
                    Tier::Fast,
                    content.len() as u64,
                    0,
                ))
                .unwrap();
            let task = MigrationTask::new(
                path,
                DriveId::from("fast"),
                DriveId::from("slow"),
                content.len() as u64,
                MigrationReason::Demote,
            );
            TaskStore::new(self.store.clone())
                .insert_planned(vec![task])
                .unwrap()
                .remove(0)
        }
    }

    impl Harness {
        /// State a crash leaves behind once the copy has started: source
        /// fingerprint recorded, placement claimed, phase persisted.
        fn interrupted_at(&self, task: &MigrationTask, phase: TaskPhase) {
            let tasks = TaskStore::new(self.store.clone());
            let fp = crate::migration::fingerprint::fingerprint_file(
                &task.path.on_drive(&self.fast),
                FingerprintAlgorithm::Blake3,
            )
            .unwrap();
            tasks.set_source_fingerprint(&task.id, &fp).unwrap();
            self.index
                .begin_migration(&task.path, &task.id, &task.source)
                .unwrap();
            tasks.set_phase(&task.id, phase).unwrap();
        }

        fn stage(&self, task: &MigrationTask, content: &[u8]) {
            let staged = staging_path(&self.slow, &task.id);
            std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
            std::fs::write(staged, content).unwrap();
        }

        /// The union serves one readable copy of `path` with `content` from
        /// `drive`, and no other drive holds it.
        fn assert_single_copy(&self, path: &LogicalPath, drive: &str, content: &[u8]) {
            let served = self.union.resolve(path).unwrap().unwrap();
            assert_eq!(served.drive_id.as_str(), drive);
            assert_eq!(std::fs::read(&served.path).unwrap(), content);
            let holders: Vec<_> = [&self.fast, &self.slow]
                .into_iter()
                .filter(|root| path.on_drive(root).exists())
                .collect();
            assert_eq!(holders.len(), 1);
        }
    }

    /// Writes garbage instead of the source bytes.
    struct CorruptingCopier;

    #[async_trait]
    impl CopyPrimitive for CorruptingCopier {
        async fn copy(&self, _src: &Path, dst: &Path) -> Result<u64> {
            std::fs::write(dst, b"corrupted").unwrap();
            Ok(9)
        }
    }

    #[tokio::test]
    async fn test_full_migration() {
        let h = harness();
        let task = h.place("media/a.bin", b"payload");
        let executor = h.executor();

        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);

        assert!(!h.fast.join("media/a.bin").exists());
        assert!(!h.fast.join("media").exists());
        assert_eq!(std::fs::read(h.slow.join("media/a.bin")).unwrap(), b"payload");
        assert!(staged_files(&h.slow).is_empty());

        let record = h.index.get(&task.path).unwrap().unwrap();
        assert_eq!(record.drive_id.as_str(), "slow");
        assert_eq!(record.tier, Tier::Slow);
        assert_eq!(record.state, PlacementState::Stable);
        let stored = executor.tasks().require(&task.id).unwrap();
        assert_eq!(stored.phase, TaskPhase::Done);
        assert_eq!(record.fingerprint, stored.source_fingerprint);

        let resolved = h.union.resolve(&task.path).unwrap().unwrap();
        assert_eq!(resolved.drive_id.as_str(), "slow");
        assert_eq!(h.union.pin(&task.path), None);
        assert!(executor.locks().is_empty());
        assert_eq!(executor.reserved_on(&DriveId::from("slow")), 0);
    }

    #[tokio::test]
    async fn test_verification_failure_keeps_source() {
        let h = harness();
        let task = h.place("a.bin", b"original");
        let executor = h.executor_with(Arc::new(CorruptingCopier));

        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(FailureKind::Retryable));

        assert_eq!(std::fs::read(h.fast.join("a.bin")).unwrap(), b"original");
        assert!(!staging_path(&h.slow, &task.id).exists());
        assert!(h.index.get(&task.path).unwrap().unwrap().is_stable());
        let stored = executor.tasks().require(&task.id).unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("Verification failed"));
        assert_eq!(
            h.union.resolve(&task.path).unwrap().unwrap().drive_id.as_str(),
            "fast"
        );
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let h = harness();
        let task = h.place("a.bin", b"original");
        let executor = h.executor_with(Arc::new(CorruptingCopier));
        let tasks = executor.tasks().clone();

        for _ in 0..3 {
            tasks.rearm_due(i64::MAX).unwrap();
            executor
                .execute(&task.id, &CancellationToken::new())
                .await
                .unwrap();
        }
        let stored = tasks.require(&task.id).unwrap();
        assert_eq!(stored.failure, Some(FailureKind::Exhausted));
        assert_eq!(stored.attempts, 3);
        assert_eq!(tasks.rearm_due(i64::MAX).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_vanished_source_is_abandoned() {
        let h = harness();
        let task = h.place("a.bin", b"x");
        std::fs::remove_file(h.fast.join("a.bin")).unwrap();

        let outcome = h
            .executor()
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(FailureKind::Abandoned));
    }

    #[tokio::test]
    async fn test_locked_path_requeues() {
        let h = harness();
        let task = h.place("a.bin", b"x");
        let executor = h.executor();
        let _held = executor.locks().try_lock(&task.path).unwrap();

        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Requeued);
        let stored = executor.tasks().require(&task.id).unwrap();
        assert_eq!(stored.phase, TaskPhase::Planned);
        assert_eq!(stored.attempts, 0);
        assert!(stored.not_before > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_capacity_recheck_requeues_without_attempt() {
        let h = harness();
        let task = h.place("a.bin", b"0123456789");
        h.probe.set(&h.slow, 10_000_000, 5);

        let executor = h.executor();
        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Requeued);
        let stored = executor.tasks().require(&task.id).unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.unwrap().contains("Capacity exceeded"));
        assert!(h.fast.join("a.bin").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness();
        let task = h.place("a.bin", b"x");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.executor().execute(&task.id, &cancel).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Interrupted);
        assert_eq!(
            h.executor().tasks().require(&task.id).unwrap().phase,
            TaskPhase::Planned
        );
    }

    #[tokio::test]
    async fn test_resume_swapping_after_visible_swap_skips_copy() {
        let h = harness();
        let task = h.place("a.bin", b"data");
        let executor = h.executor();
        let tasks = executor.tasks().clone();

        // Simulate a crash right after the pin was written.
        let fp = crate::migration::fingerprint::fingerprint_file(
            &h.fast.join("a.bin"),
            FingerprintAlgorithm::Blake3,
        )
        .unwrap();
        tasks.set_source_fingerprint(&task.id, &fp).unwrap();
        h.index
            .begin_migration(&task.path, &task.id, &task.source)
            .unwrap();
        std::fs::write(h.slow.join("a.bin"), b"data").unwrap();
        h.union
            .set_priority(&task.path, &DriveId::from("slow"), None)
            .await
            .unwrap();
        tasks.set_phase(&task.id, TaskPhase::Swapping).unwrap();

        // A copier that would fail proves no re-copy happens.
        let executor = h.executor_with(Arc::new(CorruptingCopier));
        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        assert!(!h.fast.join("a.bin").exists());
        assert_eq!(std::fs::read(h.slow.join("a.bin")).unwrap(), b"data");
    }

    /// Copies faithfully, then appends to the source like a writer going
    /// through the union while the migration runs.
    struct WriteAfterCopy;

    #[async_trait]
    impl CopyPrimitive for WriteAfterCopy {
        async fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
            let copied = NativeCopier::new().copy(src, dst).await?;
            let mut file = std::fs::OpenOptions::new().append(true).open(src).unwrap();
            std::io::Write::write_all(&mut file, b"+NEW").unwrap();
            Ok(copied)
        }
    }

    #[tokio::test]
    async fn test_source_written_during_migration_is_kept() {
        let h = harness();
        let task = h.place("a.bin", b"payload");
        let executor = h.executor_with(Arc::new(WriteAfterCopy));

        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(FailureKind::Retryable));
        h.assert_single_copy(&task.path, "fast", b"payload+NEW");
        assert_eq!(h.union.pin(&task.path), None);
        assert!(staged_files(&h.slow).is_empty());

        let record = h.index.get(&task.path).unwrap().unwrap();
        assert!(record.is_stable());
        assert_eq!(record.drive_id.as_str(), "fast");
        let stored = executor.tasks().require(&task.id).unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("changed during migration"));

        // The next attempt moves the new content.
        executor.tasks().rearm_due(i64::MAX).unwrap();
        let outcome = h
            .executor()
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        h.assert_single_copy(&task.path, "slow", b"payload+NEW");
    }

    #[tokio::test]
    async fn test_resume_copying_with_partial_stage() {
        let h = harness();
        let task = h.place("a.bin", b"payload-abc");
        h.interrupted_at(&task, TaskPhase::Copying);
        h.stage(&task, b"pay");

        let outcome = h
            .executor()
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        h.assert_single_copy(&task.path, "slow", b"payload-abc");
        assert!(staged_files(&h.slow).is_empty());
    }

    #[tokio::test]
    async fn test_resume_verifying_uses_staged_copy() {
        let h = harness();
        let task = h.place("a.bin", b"payload");
        h.interrupted_at(&task, TaskPhase::Verifying);
        h.stage(&task, b"payload");

        let executor = h.executor_with(Arc::new(CorruptingCopier));
        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        h.assert_single_copy(&task.path, "slow", b"payload");
    }

    #[tokio::test]
    async fn test_resume_cleaning_after_source_removed() {
        let h = harness();
        let task = h.place("a.bin", b"payload");
        h.interrupted_at(&task, TaskPhase::Cleaning);
        std::fs::write(h.slow.join("a.bin"), b"payload").unwrap();
        h.union
            .set_priority(&task.path, &DriveId::from("slow"), None)
            .await
            .unwrap();
        std::fs::remove_file(h.fast.join("a.bin")).unwrap();

        let executor = h.executor_with(Arc::new(CorruptingCopier));
        let outcome = executor
            .execute(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        h.assert_single_copy(&task.path, "slow", b"payload");
        let record = h.index.get(&task.path).unwrap().unwrap();
        assert!(record.is_stable());
        assert_eq!(record.drive_id.as_str(), "slow");
        assert_eq!(h.union.pin(&task.path), None);
    }

    #[test]
    fn test_prune_stops_at_root_and_non_empty() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("drive");
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/keep"), b"x").unwrap();

        prune_empty_parents(&root.join("a/b/c/file"), &root);
        assert!(!root.join("a/b").exists());
        assert!(root.join("a/keep").exists());
        assert!(root.exists());
    }
}
