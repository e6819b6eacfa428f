//! The tiering engine: owns every component and runs the periodic loops.
//!
//! Operator-facing methods live in `impl TierEngine` blocks in the
//! submodules; this file holds the struct and its lifecycle.

mod builder;
mod operations;
mod status;

pub use builder::TierEngineBuilder;
pub use operations::CycleReport;
pub use status::{DriveStatus, EngineStatus, TierStatus};

use crate::cancel::CancellationToken;
use crate::config::{IntervalConfig, TieringConfig};
use crate::drives::DriveRegistry;
use crate::index::PlacementIndex;
use crate::maintenance::{run_maintenance, DriveWatcher, Reconciler};
use crate::migration::{recover, Dispatcher, MigrationExecutor, RecoveryReport, TaskStore};
use crate::policy::PolicyEngine;
use crate::temperature::TemperatureSampler;
use crate::union::{Branch, UnionNamespace};
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handle to a running or not-yet-started engine. Cheap to clone.
#[derive(Clone)]
pub struct TierEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: TieringConfig,
    registry: DriveRegistry,
    index: PlacementIndex,
    tasks: TaskStore,
    sampler: TemperatureSampler,
    policy: PolicyEngine,
    union: Arc<dyn UnionNamespace>,
    executor: MigrationExecutor,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    reconcile_trigger: Arc<Notify>,
    /// Serializes policy cycles so two never plan from the same snapshot.
    cycle_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<DriveWatcher>>,
}

impl TierEngine {
    pub fn builder(config: TieringConfig) -> TierEngineBuilder {
        TierEngineBuilder::new(config)
    }

    pub fn config(&self) -> &TieringConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &DriveRegistry {
        &self.inner.registry
    }

    pub fn index(&self) -> &PlacementIndex {
        &self.inner.index
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    pub fn sampler(&self) -> &TemperatureSampler {
        &self.inner.sampler
    }

    pub fn union(&self) -> &Arc<dyn UnionNamespace> {
        &self.inner.union
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Point the union at the current set of usable drives.
    pub(crate) fn sync_branches(&self) -> Result<()> {
        let branches = Branch::from_drives(&self.inner.registry.list()?);
        self.inner.union.set_branches(branches);
        Ok(())
    }

    /// Repair interrupted migrations. Part of [`start`](Self::start); exposed
    /// for one-shot runs.
    pub fn recover(&self) -> Result<RecoveryReport> {
        recover(
            &self.inner.tasks,
            &self.inner.index,
            &self.inner.registry,
            self.inner.union.as_ref(),
        )
    }

    /// Mount the union, recover, then start the periodic loops.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let branches = Branch::from_drives(&inner.registry.list()?);
        inner.union.mount(branches).await?;
        self.recover()?;

        let intervals = inner.config.intervals.clone();
        let mut handles = Vec::new();

        let sampler = inner.sampler.clone();
        let cancel = inner.cancel.clone();
        handles.push(tokio::spawn(async move {
            sampler.run(intervals.sample(), cancel).await;
        }));

        let engine = self.clone();
        let interval = inner.config.intervals.tiering_check();
        handles.push(tokio::spawn(async move {
            engine.run_policy_loop(interval).await;
        }));

        let engine = self.clone();
        let interval = inner.config.intervals.capacity_refresh();
        handles.push(tokio::spawn(async move {
            engine.run_capacity_loop(interval).await;
        }));

        handles.push(tokio::spawn(run_maintenance(
            inner.reconciler.clone(),
            inner.config.intervals.maintenance(),
            Arc::clone(&inner.reconcile_trigger),
            inner.cancel.clone(),
        )));

        let dispatcher = inner.dispatcher.clone();
        let cancel = inner.cancel.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.run(cancel).await;
        }));

        let roots: Vec<_> = inner
            .registry
            .list()?
            .into_iter()
            .filter(|d| d.is_online())
            .map(|d| d.mount_path)
            .collect();
        match DriveWatcher::new(
            &roots,
            IntervalConfig::WATCHER_DEBOUNCE,
            Arc::clone(&inner.reconcile_trigger),
        ) {
            Ok(watcher) => {
                if let Ok(mut slot) = inner.watcher.lock() {
                    *slot = Some(watcher);
                }
            }
            Err(e) => warn!("Drive watcher unavailable, relying on periodic reconcile: {}", e),
        }

        if let Ok(mut slot) = inner.handles.lock() {
            slot.extend(handles);
        }
        info!("Tiering engine started");
        Ok(())
    }

    async fn run_policy_loop(&self, interval: std::time::Duration) {
        let cancel = self.inner.cancel.clone();
        while cancel.sleep(interval).await {
            if let Err(e) = self.run_cycle().await {
                error!("Policy cycle failed: {}", e);
            }
        }
    }

    async fn run_capacity_loop(&self, interval: std::time::Duration) {
        let cancel = self.inner.cancel.clone();
        while cancel.sleep(interval).await {
            if let Err(e) = self.refresh_all_capacity() {
                warn!("Capacity refresh failed: {}", e);
            }
        }
    }

    /// Stop every loop, wait for in-flight phases to finish, unmount.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down tiering engine");
        self.inner.cancel.cancel();
        if let Ok(mut slot) = self.inner.watcher.lock() {
            slot.take();
        }

        let handles: Vec<_> = match self.inner.handles.lock() {
            Ok(mut slot) => slot.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Engine task panicked: {}", e);
            }
        }

        self.inner.union.unmount().await?;
        info!("Tiering engine stopped");
        Ok(())
    }
}
