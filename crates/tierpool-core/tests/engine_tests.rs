//! End-to-end tests of the tiering engine over temporary drive directories.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tierpool_core::config::{MigrationSettings, StaticDrive, UnionSettings};
use tierpool_core::drives::{Capacity, CapacityProbe};
use tierpool_core::migration::{
    fingerprint_file, staging_path, CopyPrimitive, FingerprintAlgorithm, MigrationReason,
    NativeCopier,
};
use tierpool_core::temperature::{AccessEvent, AccessSource, JournalSource};
use tierpool_core::{
    DriveId, LogicalPath, MigrationTask, TaskPhase, Tier, TierEngine, TierError, TieringConfig,
};

/// Fixed total size; used bytes are a constant base plus whatever the drive
/// directory holds, so moving files changes the reported capacity.
struct DirUsageProbe {
    drives: Vec<(PathBuf, u64, u64)>,
}

impl CapacityProbe for DirUsageProbe {
    fn probe(&self, mount_path: &Path) -> tierpool_core::Result<Capacity> {
        let (_, total, base) = self
            .drives
            .iter()
            .find(|(root, _, _)| root == mount_path)
            .ok_or_else(|| TierError::Other(format!("unknown drive {}", mount_path.display())))?;
        let held: u64 = walkdir::WalkDir::new(mount_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        let used = base + held;
        Ok(Capacity {
            total_bytes: *total,
            free_bytes: total.saturating_sub(used),
        })
    }
}

/// Counts calls and delegates to the native copier.
#[derive(Default)]
struct CountingCopier {
    calls: AtomicUsize,
}

#[async_trait]
impl CopyPrimitive for CountingCopier {
    async fn copy(&self, src: &Path, dst: &Path) -> tierpool_core::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        NativeCopier::new().copy(src, dst).await
    }
}

/// Writes garbage instead of the source bytes.
struct CorruptingCopier;

#[async_trait]
impl CopyPrimitive for CorruptingCopier {
    async fn copy(&self, _src: &Path, dst: &Path) -> tierpool_core::Result<u64> {
        std::fs::write(dst, b"corrupted").unwrap();
        Ok(9)
    }
}

struct Fixture {
    temp: TempDir,
    fast: PathBuf,
    slow: PathBuf,
    fast_base: u64,
}

impl Fixture {
    /// Drive A: fast, 100 000 bytes, 85 000 used by other data.
    /// Drive B: slow, 1 000 000 bytes, 200 000 used.
    fn new() -> Self {
        Self::with_fast_base(85_000)
    }

    fn with_fast_base(fast_base: u64) -> Self {
        let temp = TempDir::new().unwrap();
        let fast = temp.path().join("drives/a");
        let slow = temp.path().join("drives/b");
        std::fs::create_dir_all(&fast).unwrap();
        std::fs::create_dir_all(&slow).unwrap();
        Self {
            temp,
            fast,
            slow,
            fast_base,
        }
    }

    fn config(&self) -> TieringConfig {
        TieringConfig {
            state_dir: self.temp.path().join("state"),
            drives: vec![
                StaticDrive {
                    id: "A".to_string(),
                    mount_path: self.fast.clone(),
                    tier: Tier::Fast,
                },
                StaticDrive {
                    id: "B".to_string(),
                    mount_path: self.slow.clone(),
                    tier: Tier::Slow,
                },
            ],
            require_mountpoint: false,
            union: UnionSettings {
                manage_mount: false,
                ..Default::default()
            },
            migration: MigrationSettings {
                reserve_bytes: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn probe(&self) -> Arc<DirUsageProbe> {
        Arc::new(DirUsageProbe {
            drives: vec![
                (self.fast.clone(), 100_000, self.fast_base),
                (self.slow.clone(), 1_000_000, 200_000),
            ],
        })
    }

    async fn engine_with(&self, config: TieringConfig, copier: Arc<dyn CopyPrimitive>) -> TierEngine {
        TierEngine::builder(config)
            .in_memory(true)
            .capacity_probe(self.probe())
            .access_sources(Vec::new())
            .copier(copier)
            .build()
            .await
            .unwrap()
    }

    async fn engine(&self) -> TierEngine {
        self.engine_with(self.config(), Arc::new(NativeCopier::new()))
            .await
    }

    fn write(&self, root: &Path, path: &str, content: &[u8]) {
        let file = root.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, content).unwrap();
    }
}

fn logical(path: &str) -> LogicalPath {
    LogicalPath::new(path).unwrap()
}

#[tokio::test]
async fn test_cold_file_demoted_from_full_fast_drive() {
    let fx = Fixture::new();
    let payload = vec![7u8; 10_000];
    fx.write(&fx.fast, "media/f.bin", &payload);

    let engine = fx.engine().await;
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.discovered, 1);

    let before = engine.refresh_capacity(&DriveId::from("A")).unwrap();
    assert_eq!(before.used_bytes(), 95_000);

    let cycle = engine.run_cycle().await.unwrap();
    assert_eq!(cycle.queued.len(), 1);
    let task = &cycle.queued[0];
    assert_eq!(task.path, logical("media/f.bin"));
    assert_eq!(task.source, DriveId::from("A"));
    assert_eq!(task.dest, DriveId::from("B"));

    engine.run_migrations(10).await.unwrap();

    let done = engine.tasks().require(&task.id).unwrap();
    assert_eq!(done.phase, TaskPhase::Done);
    let record = engine.index().get(&logical("media/f.bin")).unwrap().unwrap();
    assert_eq!(record.drive_id, DriveId::from("B"));
    assert_eq!(record.tier, Tier::Slow);

    let location = engine.resolve("media/f.bin").unwrap().unwrap();
    assert_eq!(location.drive_id, DriveId::from("B"));
    assert_eq!(std::fs::read(&location.path).unwrap(), payload);
    assert!(!fx.fast.join("media/f.bin").exists());

    let after = engine.refresh_capacity(&DriveId::from("A")).unwrap();
    assert_eq!(before.used_bytes() - after.used_bytes(), 10_000);

    // Nothing changed, so a second cycle plans nothing.
    let again = engine.run_cycle().await.unwrap();
    assert!(again.queued.is_empty());
}

#[tokio::test]
async fn test_hot_file_stays_on_fast_tier() {
    let fx = Fixture::with_fast_base(0);
    fx.write(&fx.fast, "hot.bin", &[1u8; 1_000]);

    let engine = fx.engine().await;
    engine.reconcile().await.unwrap();

    let now = tierpool_core::temperature::unix_now();
    let events: Vec<AccessEvent> = (0..20)
        .map(|i| AccessEvent {
            path: logical("hot.bin"),
            at: now - i,
        })
        .collect();
    engine.sampler().record(&events).unwrap();

    let cycle = engine.run_cycle().await.unwrap();
    assert!(cycle.queued.is_empty());
}

#[tokio::test]
async fn test_corrupted_copy_fails_and_keeps_source() {
    let fx = Fixture::new();
    fx.write(&fx.fast, "f.bin", b"precious bytes");

    let mut config = fx.config();
    config.migration.max_attempts = 1;
    let engine = fx.engine_with(config, Arc::new(CorruptingCopier)).await;
    engine.reconcile().await.unwrap();

    let cycle = engine.run_cycle().await.unwrap();
    assert_eq!(cycle.queued.len(), 1);
    engine.run_migrations(10).await.unwrap();

    let failed = engine.list_failed_tasks().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].phase, TaskPhase::Failed);

    assert_eq!(std::fs::read(fx.fast.join("f.bin")).unwrap(), b"precious bytes");
    let location = engine.resolve("f.bin").unwrap().unwrap();
    assert_eq!(location.drive_id, DriveId::from("A"));
    let record = engine.index().get(&logical("f.bin")).unwrap().unwrap();
    assert_eq!(record.drive_id, DriveId::from("A"));
    assert!(!fx.slow.join("f.bin").exists());
}

#[tokio::test]
async fn test_restart_after_visible_swap_skips_copy() {
    let fx = Fixture::new();
    fx.write(&fx.fast, "f.bin", b"swap me");

    let copier = Arc::new(CountingCopier::default());
    let engine = fx.engine_with(fx.config(), copier.clone()).await;
    engine.reconcile().await.unwrap();

    // Recreate what a crash right after the union switch leaves behind.
    let path = logical("f.bin");
    let task = engine
        .tasks()
        .insert_planned(vec![MigrationTask::new(
            path.clone(),
            DriveId::from("A"),
            DriveId::from("B"),
            7,
            MigrationReason::Demote,
        )])
        .unwrap()
        .remove(0);
    let fingerprint = fingerprint_file(&fx.fast.join("f.bin"), FingerprintAlgorithm::Blake3).unwrap();
    engine.tasks().set_source_fingerprint(&task.id, &fingerprint).unwrap();
    engine
        .index()
        .begin_migration(&path, &task.id, &DriveId::from("A"))
        .unwrap();
    let staged = staging_path(&fx.slow, &task.id);
    std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
    std::fs::copy(fx.fast.join("f.bin"), &staged).unwrap();
    engine
        .union()
        .set_priority(&path, &DriveId::from("B"), Some(&staged))
        .await
        .unwrap();
    engine.tasks().set_phase(&task.id, TaskPhase::Swapping).unwrap();

    let report = engine.recover().unwrap();
    assert_eq!(report.swaps_visible, 1);
    assert_eq!(
        engine.tasks().require(&task.id).unwrap().phase,
        TaskPhase::Cleaning
    );

    engine.run_migrations(10).await.unwrap();
    assert_eq!(copier.calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.tasks().require(&task.id).unwrap().phase, TaskPhase::Done);
    assert!(!fx.fast.join("f.bin").exists());
    let location = engine.resolve("f.bin").unwrap().unwrap();
    assert_eq!(location.drive_id, DriveId::from("B"));
    assert_eq!(std::fs::read(location.path).unwrap(), b"swap me");
}

#[tokio::test]
async fn test_journal_replay_counts_each_access_once() {
    let fx = Fixture::new();
    fx.write(&fx.fast, "j.bin", b"x");
    let journal = fx.temp.path().join("access.jsonl");
    let now = tierpool_core::temperature::unix_now();
    std::fs::write(
        &journal,
        format!(
            "{{\"path\":\"j.bin\",\"at\":{}}}\n{{\"path\":\"j.bin\",\"at\":{}}}\n",
            now - 10,
            now - 5
        ),
    )
    .unwrap();

    let sources: Vec<Arc<dyn AccessSource>> = vec![Arc::new(JournalSource::new(journal.clone()))];
    let engine = TierEngine::builder(fx.config())
        .in_memory(true)
        .capacity_probe(fx.probe())
        .access_sources(sources)
        .build()
        .await
        .unwrap();
    engine.reconcile().await.unwrap();

    assert_eq!(engine.sample_now().await.unwrap().applied, 2);
    assert_eq!(engine.sample_now().await.unwrap().applied, 0);

    let count = |engine: &TierEngine| {
        engine
            .sampler()
            .entries()
            .unwrap()
            .into_iter()
            .find(|e| e.path == logical("j.bin"))
            .map(|e| e.access_count)
    };
    assert_eq!(count(&engine), Some(2));

    let mut tail = std::fs::OpenOptions::new().append(true).open(&journal).unwrap();
    std::io::Write::write_all(&mut tail, format!("{{\"path\":\"j.bin\",\"at\":{}}}\n", now).as_bytes())
        .unwrap();
    assert_eq!(engine.sample_now().await.unwrap().applied, 1);
    assert_eq!(count(&engine), Some(3));
}

#[tokio::test]
async fn test_deregister_drive_with_pending_task_is_busy() {
    let fx = Fixture::new();
    fx.write(&fx.fast, "f.bin", &[0u8; 500]);

    let engine = fx.engine().await;
    engine.reconcile().await.unwrap();
    assert_eq!(engine.run_cycle().await.unwrap().queued.len(), 1);

    for id in ["A", "B"] {
        let err = engine.deregister_drive(&DriveId::from(id)).unwrap_err();
        assert!(matches!(err, TierError::DriveBusy { .. }), "{id}: {err}");
    }
    assert_eq!(engine.list_drives().unwrap().len(), 2);

    engine.run_migrations(10).await.unwrap();
    engine.deregister_drive(&DriveId::from("A")).unwrap();
    assert_eq!(engine.list_drives().unwrap().len(), 1);
    assert!(engine.union().branches().iter().all(|b| b.drive_id != DriveId::from("A")));
}

#[tokio::test]
async fn test_status_reports_drives_and_tasks() {
    let fx = Fixture::new();
    fx.write(&fx.fast, "f.bin", &[0u8; 2_000]);

    let engine = fx.engine().await;
    engine.reconcile().await.unwrap();
    engine.run_cycle().await.unwrap();

    let status = engine.status().unwrap();
    assert_eq!(status.drives.len(), 2);
    let a = status.drives.iter().find(|d| d.id == DriveId::from("A")).unwrap();
    assert_eq!(a.indexed_files, 1);
    assert_eq!(a.indexed_bytes, 2_000);
    assert!(a.in_union);
    assert_eq!(status.tasks.get("planned"), Some(&1));
    assert_eq!(status.tiers[&Tier::Fast].drives, 1);
    assert_eq!(status.failed_tasks, 0);
}
