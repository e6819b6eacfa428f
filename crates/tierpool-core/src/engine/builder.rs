//! Builder for assembling a [`TierEngine`].

use super::{EngineInner, TierEngine};
use crate::cancel::CancellationToken;
use crate::command::CommandRunner;
use crate::config::TieringConfig;
use crate::drives::{CapacityProbe, Drive, DriveRegistry, Provisioner, StatvfsProbe};
use crate::error::{Result, TierError};
use crate::index::PlacementIndex;
use crate::maintenance::Reconciler;
use crate::migration::{
    CopyPrimitive, Dispatcher, Fingerprinter, MigrationExecutor, StreamingFingerprinter, TaskStore,
};
use crate::policy::PolicyEngine;
use crate::store::StateStore;
use crate::temperature::{AccessSource, AtimeSource, JournalSource, TemperatureSampler};
use crate::union::{BranchUnion, UnionNamespace};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Builder for configuring engine initialization.
///
/// Every component has a production default derived from the
/// configuration; tests swap in their own capacity probe, union, copier or
/// access sources.
///
/// # Example
///
/// ```rust,ignore
/// let engine = TierEngine::builder(TieringConfig::load(path)?)
///     .provision(true)
///     .build()
///     .await?;
/// engine.start().await?;
/// ```
pub struct TierEngineBuilder {
    config: TieringConfig,
    provision: bool,
    in_memory: bool,
    probe: Option<Arc<dyn CapacityProbe>>,
    union: Option<Arc<dyn UnionNamespace>>,
    copier: Option<Arc<dyn CopyPrimitive>>,
    fingerprinter: Option<Arc<dyn Fingerprinter>>,
    sources: Option<Vec<Arc<dyn AccessSource>>>,
}

impl TierEngineBuilder {
    pub fn new(config: TieringConfig) -> Self {
        Self {
            config,
            provision: false,
            in_memory: false,
            probe: None,
            union: None,
            copier: None,
            fingerprinter: None,
            sources: None,
        }
    }

    /// Discover, format and mount block devices before registering drives.
    ///
    /// Default: `false`
    pub fn provision(mut self, enable: bool) -> Self {
        self.provision = enable;
        self
    }

    /// Keep the state store in memory instead of `state_dir/state.db`.
    pub fn in_memory(mut self, enable: bool) -> Self {
        self.in_memory = enable;
        self
    }

    pub fn capacity_probe(mut self, probe: Arc<dyn CapacityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn union(mut self, union: Arc<dyn UnionNamespace>) -> Self {
        self.union = Some(union);
        self
    }

    pub fn copier(mut self, copier: Arc<dyn CopyPrimitive>) -> Self {
        self.copier = Some(copier);
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = Some(fingerprinter);
        self
    }

    /// Replace the configured access sources.
    pub fn access_sources(mut self, sources: Vec<Arc<dyn AccessSource>>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Open state, register drives and assemble every component. Nothing
    /// runs until [`TierEngine::start`].
    pub async fn build(self) -> Result<TierEngine> {
        let config = self.config;
        config.validate()?;

        let store = if self.in_memory {
            StateStore::open_in_memory()?
        } else {
            std::fs::create_dir_all(&config.state_dir).map_err(|e| TierError::Io {
                message: format!(
                    "Failed to create state directory: {}",
                    config.state_dir.display()
                ),
                path: Some(config.state_dir.clone()),
                source: Some(e),
            })?;
            StateStore::open(&config.db_path())?
        };
        let runner = CommandRunner::new(config.dry_run);

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(StatvfsProbe::new(config.require_mountpoint)));
        let registry = DriveRegistry::new(store.clone(), probe);

        for declared in &config.drives {
            registry.register(Drive::new(
                declared.id.as_str(),
                declared.mount_path.clone(),
                declared.tier,
            ))?;
        }
        if self.provision {
            let provisioner = Provisioner::new(runner.clone(), &config);
            for drive in provisioner.provision_all().await? {
                registry.register(drive)?;
            }
        }
        for (id, outcome) in registry.refresh_all()? {
            if let Err(e) = outcome {
                warn!("Drive {} unavailable at startup: {}", id, e);
            }
        }

        let union: Arc<dyn UnionNamespace> = match self.union {
            Some(union) => union,
            None => Arc::new(BranchUnion::open(
                config.union.clone(),
                runner.clone(),
                config.pins_path(),
            )?),
        };

        let index = PlacementIndex::new(store.clone());
        let tasks = TaskStore::new(store.clone());

        let sources = self.sources.unwrap_or_else(|| {
            let mut sources: Vec<Arc<dyn AccessSource>> = Vec::new();
            if let Some(journal) = &config.temperature.journal_path {
                sources.push(Arc::new(JournalSource::new(journal.clone())));
            }
            if config.temperature.atime_sampling {
                sources.push(Arc::new(AtimeSource::new(registry.clone())));
            }
            sources
        });
        let source_names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
        let half_life = Duration::from_secs(config.temperature.half_life_secs);
        let sampler = TemperatureSampler::new(store.clone(), index.clone(), sources, half_life);

        let policy = PolicyEngine::from_config(&config)?;

        let copier = self
            .copier
            .unwrap_or_else(|| config.migration.copier.build(runner.clone()));
        let fingerprinter = self
            .fingerprinter
            .unwrap_or_else(|| Arc::new(StreamingFingerprinter::new(config.migration.fingerprint)));
        let executor = MigrationExecutor::new(
            store.clone(),
            registry.clone(),
            Arc::clone(&union),
            copier,
            fingerprinter,
            &config.migration,
        );
        let dispatcher = Dispatcher::new(
            executor.clone(),
            config.migration.io_threads,
            config.intervals.dispatch_tick(),
        );
        let reconciler = Reconciler::new(
            registry.clone(),
            index.clone(),
            tasks.clone(),
            sampler.clone(),
            Arc::clone(&union),
            executor.locks().clone(),
        );

        let engine = TierEngine {
            inner: Arc::new(EngineInner {
                config,
                registry,
                index,
                tasks,
                sampler,
                policy,
                union,
                executor,
                dispatcher,
                reconciler,
                reconcile_trigger: Arc::new(Notify::new()),
                cycle_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
            }),
        };
        engine.sync_branches()?;

        info!(
            "Tiering engine ready: {} drives, access sources [{}]",
            engine.inner.registry.list()?.len(),
            source_names.join(", ")
        );
        Ok(engine)
    }
}
