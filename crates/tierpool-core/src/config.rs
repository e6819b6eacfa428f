//! Centralized configuration for tierpool.
//!
//! Compile-time defaults live as associated constants on unit structs; the
//! runtime configuration is a JSON document deserialized into
//! [`TieringConfig`].

use crate::drives::Tier;
use crate::error::{Result, TierError};
use crate::migration::{CopierKind, FingerprintAlgorithm};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Daemon-level defaults.
pub struct DaemonConfig;

impl DaemonConfig {
    pub const APP_NAME: &'static str = "tierpool";
    pub const CONFIG_FILE_PATH: &'static str = "/etc/tierpool/config.json";
    pub const STATE_DIR: &'static str = "/var/lib/tierpool";
    pub const PHYSICAL_ROOT: &'static str = "/mnt/physical";
    pub const UNION_MOUNT: &'static str = "/mnt/merged";
    pub const FILESYSTEM: &'static str = "ext4";
    pub const ADMIN_HOST: &'static str = "127.0.0.1";
    pub const ADMIN_PORT: u16 = 7447;
}

/// Periodic task cadence.
pub struct IntervalConfig;

impl IntervalConfig {
    pub const TIERING_CHECK: Duration = Duration::from_secs(7200);
    pub const SAMPLE: Duration = Duration::from_secs(300);
    pub const CAPACITY_REFRESH: Duration = Duration::from_secs(60);
    pub const MAINTENANCE: Duration = Duration::from_secs(86_400);
    pub const MAINTENANCE_AFTER_ERROR: Duration = Duration::from_secs(3600);
    pub const DISPATCH_TICK: Duration = Duration::from_millis(1000);
    pub const WATCHER_DEBOUNCE: Duration = Duration::from_secs(5);
}

/// Migration executor defaults.
pub struct MigrationConfig;

impl MigrationConfig {
    pub const IO_THREADS: usize = 4;
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BACKOFF_BASE: Duration = Duration::from_secs(60);
    pub const BACKOFF_MAX: Duration = Duration::from_secs(3600);
    pub const LOCK_RETRY: Duration = Duration::from_secs(5);
    pub const RESERVE_BYTES: u64 = 1024 * 1024 * 1024;
    pub const COPY_CHUNK_SIZE: usize = 8 * 1024 * 1024;
    /// Finished task history kept before maintenance prunes it.
    pub const HISTORY_RETENTION: Duration = Duration::from_secs(30 * 86_400);
}

/// Temperature model defaults.
pub struct TemperatureConfig;

impl TemperatureConfig {
    /// An access loses half its weight after this long.
    pub const HALF_LIFE: Duration = Duration::from_secs(86_400);
    pub const JOURNAL_WATERMARK: &'static str = "journal";
    pub const ATIME_WATERMARK: &'static str = "atime";
}

/// On-disk layout of the state directory and of each drive.
pub struct LayoutConfig;

impl LayoutConfig {
    pub const DB_FILENAME: &'static str = "state.db";
    pub const PINS_FILENAME: &'static str = "union-pins.json";
    /// Engine-owned directory at the root of every drive, hidden from sampling.
    pub const INTERNAL_DIR: &'static str = ".tierpool";
    pub const STAGING_DIR: &'static str = "staging";
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Capacity and temperature policy for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier: Tier,
    /// Usage ratio (0-1) above which the tier sheds its coldest files.
    pub high_watermark: f64,
    /// Usage ratio (0-1) pressure demotion stops at.
    pub low_watermark: f64,
    /// Files on the next slower tier at or above this temperature move up
    /// into this tier.
    #[serde(default)]
    pub promote_threshold: Option<f64>,
    /// Files on this tier below this temperature move to the next slower tier.
    #[serde(default)]
    pub demote_threshold: Option<f64>,
}

impl TierPolicy {
    pub fn defaults_for(tier: Tier) -> Self {
        match tier {
            Tier::Fast => Self {
                tier,
                high_watermark: 0.85,
                low_watermark: 0.75,
                promote_threshold: Some(3.0),
                demote_threshold: Some(0.5),
            },
            Tier::Slow => Self {
                tier,
                high_watermark: 0.90,
                low_watermark: 0.80,
                promote_threshold: Some(1.5),
                demote_threshold: Some(0.05),
            },
            Tier::Archival => Self {
                tier,
                high_watermark: 0.95,
                low_watermark: 0.90,
                promote_threshold: None,
                demote_threshold: None,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        let field = format!("tiers.{}", self.tier);
        if !(0.0..=1.0).contains(&self.high_watermark) {
            return Err(TierError::Validation {
                field,
                message: format!("high_watermark {} outside 0..=1", self.high_watermark),
            });
        }
        if self.low_watermark < 0.0 || self.low_watermark >= self.high_watermark {
            return Err(TierError::Validation {
                field,
                message: format!(
                    "low_watermark {} must be >= 0 and below high_watermark {}",
                    self.low_watermark, self.high_watermark
                ),
            });
        }
        if let (Some(promote), Some(demote)) = (self.promote_threshold, self.demote_threshold) {
            if demote >= promote {
                return Err(TierError::Validation {
                    field,
                    message: format!(
                        "demote_threshold {} must be below promote_threshold {}",
                        demote, promote
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A drive declared in the config file instead of discovered by provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDrive {
    pub id: String,
    pub mount_path: PathBuf,
    pub tier: Tier,
}

/// Union mount settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnionSettings {
    /// Run `mergerfs`/`fusermount` at all. Disable when the mount is managed
    /// elsewhere (fstab, systemd) or in tests.
    pub manage_mount: bool,
    pub mount_point: PathBuf,
    pub options: Vec<String>,
    /// mergerfs create category; `ff` with fastest-first branches lands new
    /// files on the fast tier.
    pub create_policy: String,
    /// Tier-scoped views, each mounted at `mount_point/<name>`. Empty mounts
    /// a single pool of every drive at `mount_point` itself.
    pub pools: Vec<PoolSettings>,
}

/// One mergerfs pool over the drives of `min_tier` and every slower tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub name: String,
    pub min_tier: Tier,
    pub create_policy: String,
}

impl PoolSettings {
    fn new(name: &str, min_tier: Tier, create_policy: &str) -> Self {
        Self {
            name: name.to_string(),
            min_tier,
            create_policy: create_policy.to_string(),
        }
    }

    /// `hot` over every drive, `warm` without the fast tier, `cold` over
    /// archival drives only, filling the emptiest one first.
    pub fn defaults() -> Vec<PoolSettings> {
        vec![
            PoolSettings::new("hot", Tier::Fast, "ff"),
            PoolSettings::new("warm", Tier::Slow, "ff"),
            PoolSettings::new("cold", Tier::Archival, "mfs"),
        ]
    }
}

impl Default for UnionSettings {
    fn default() -> Self {
        Self {
            manage_mount: true,
            mount_point: PathBuf::from(DaemonConfig::UNION_MOUNT),
            options: [
                "allow_other",
                "lazy-umount-mountpoint=true",
                "moveonenospc=true",
                "cache.files=auto-full",
                "cache.statfs=true",
                "dropcacheonclose=true",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            create_policy: "ff".to_string(),
            pools: PoolSettings::defaults(),
        }
    }
}

/// Access-temperature settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureSettings {
    pub half_life_secs: u64,
    /// JSON-lines access journal written by an external access logger.
    pub journal_path: Option<PathBuf>,
    /// Derive access events from file atimes on the drives.
    pub atime_sampling: bool,
}

impl Default for TemperatureSettings {
    fn default() -> Self {
        Self {
            half_life_secs: TemperatureConfig::HALF_LIFE.as_secs(),
            journal_path: None,
            atime_sampling: true,
        }
    }
}

/// Periodic loop intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalSettings {
    pub tiering_check_secs: u64,
    pub sample_secs: u64,
    pub capacity_refresh_secs: u64,
    pub maintenance_secs: u64,
    pub dispatch_tick_ms: u64,
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            tiering_check_secs: IntervalConfig::TIERING_CHECK.as_secs(),
            sample_secs: IntervalConfig::SAMPLE.as_secs(),
            capacity_refresh_secs: IntervalConfig::CAPACITY_REFRESH.as_secs(),
            maintenance_secs: IntervalConfig::MAINTENANCE.as_secs(),
            dispatch_tick_ms: IntervalConfig::DISPATCH_TICK.as_millis() as u64,
        }
    }
}

impl IntervalSettings {
    pub fn tiering_check(&self) -> Duration {
        Duration::from_secs(self.tiering_check_secs)
    }
    pub fn sample(&self) -> Duration {
        Duration::from_secs(self.sample_secs)
    }
    pub fn capacity_refresh(&self) -> Duration {
        Duration::from_secs(self.capacity_refresh_secs)
    }
    pub fn maintenance(&self) -> Duration {
        Duration::from_secs(self.maintenance_secs)
    }
    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }
}

/// Migration executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub io_threads: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub lock_retry_secs: u64,
    /// Bytes kept free on every destination drive.
    pub reserve_bytes: u64,
    pub copier: CopierKind,
    pub fingerprint: FingerprintAlgorithm,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            io_threads: MigrationConfig::IO_THREADS,
            max_attempts: MigrationConfig::MAX_ATTEMPTS,
            backoff_base_secs: MigrationConfig::BACKOFF_BASE.as_secs(),
            backoff_max_secs: MigrationConfig::BACKOFF_MAX.as_secs(),
            lock_retry_secs: MigrationConfig::LOCK_RETRY.as_secs(),
            reserve_bytes: MigrationConfig::RESERVE_BYTES,
            copier: CopierKind::Native,
            fingerprint: FingerprintAlgorithm::Blake3,
        }
    }
}

/// Runtime configuration loaded from the JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    pub state_dir: PathBuf,
    /// Where provisioned drives are mounted: `<root>/<class>/<serial>`.
    pub physical_root: PathBuf,
    pub filesystem: String,
    /// Device serials never provisioned or registered.
    pub exclude_drives: Vec<String>,
    pub drives: Vec<StaticDrive>,
    /// Treat a drive whose path is not a mount point as unreachable, so an
    /// unmounted drive never reports the root filesystem's capacity.
    pub require_mountpoint: bool,
    /// Regular expressions over logical paths that are never migrated.
    pub exclude_paths: Vec<String>,
    /// Legacy single capacity threshold in percent; when set it overrides
    /// every tier's high watermark (low = high - 10 points).
    pub tier_capacity_threshold: Option<f64>,
    pub tiers: Vec<TierPolicy>,
    pub union: UnionSettings,
    pub temperature: TemperatureSettings,
    pub intervals: IntervalSettings,
    pub migration: MigrationSettings,
    /// Log external commands instead of running them.
    pub dry_run: bool,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DaemonConfig::STATE_DIR),
            physical_root: PathBuf::from(DaemonConfig::PHYSICAL_ROOT),
            filesystem: DaemonConfig::FILESYSTEM.to_string(),
            exclude_drives: Vec::new(),
            drives: Vec::new(),
            require_mountpoint: true,
            exclude_paths: Vec::new(),
            tier_capacity_threshold: None,
            tiers: Tier::ALL.iter().map(|t| TierPolicy::defaults_for(*t)).collect(),
            union: UnionSettings::default(),
            temperature: TemperatureSettings::default(),
            intervals: IntervalSettings::default(),
            migration: MigrationSettings::default(),
            dry_run: false,
        }
    }
}

impl TieringConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the built-in defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                let mut config: TieringConfig =
                    serde_json::from_str(&contents).map_err(|e| TierError::Config {
                        message: format!("Failed to parse {}: {}", path.display(), e),
                    })?;
                config.apply_legacy_threshold();
                info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(TierError::io_with_path(e, path)),
        };

        config.validate()?;
        Ok(config)
    }

    fn apply_legacy_threshold(&mut self) {
        if let Some(percent) = self.tier_capacity_threshold {
            let high = (percent / 100.0).clamp(0.0, 1.0);
            for policy in &mut self.tiers {
                policy.high_watermark = high;
                policy.low_watermark = (high - 0.10).max(0.0);
            }
        }
    }

    /// Check watermarks, thresholds, and patterns for consistency.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            if self.tiers.iter().filter(|p| p.tier == tier).count() > 1 {
                return Err(TierError::Validation {
                    field: "tiers".to_string(),
                    message: format!("tier {} configured more than once", tier),
                });
            }
        }
        for policy in &self.tiers {
            policy.validate()?;
        }
        let mut pool_names = HashSet::new();
        for pool in &self.union.pools {
            let plain = !pool.name.is_empty()
                && pool.name != "."
                && pool.name != ".."
                && !pool.name.contains('/');
            if !plain || !pool_names.insert(pool.name.as_str()) {
                return Err(TierError::Validation {
                    field: "union.pools".to_string(),
                    message: format!("pool name {:?} is empty, nested or repeated", pool.name),
                });
            }
        }
        for pattern in &self.exclude_paths {
            Regex::new(pattern).map_err(|e| TierError::Validation {
                field: "exclude_paths".to_string(),
                message: format!("invalid pattern {:?}: {}", pattern, e),
            })?;
        }
        if self.migration.io_threads == 0 {
            return Err(TierError::Validation {
                field: "migration.io_threads".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.migration.max_attempts == 0 {
            return Err(TierError::Validation {
                field: "migration.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.temperature.half_life_secs == 0 {
            return Err(TierError::Validation {
                field: "temperature.half_life_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Policy for a tier, falling back to the built-in defaults.
    pub fn policy_for(&self, tier: Tier) -> TierPolicy {
        self.tiers
            .iter()
            .find(|p| p.tier == tier)
            .cloned()
            .unwrap_or_else(|| TierPolicy::defaults_for(tier))
    }

    /// Compiled exclusion patterns. Call after [`validate`](Self::validate).
    pub fn exclude_patterns(&self) -> Result<Vec<Regex>> {
        self.exclude_paths
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| TierError::Validation {
                    field: "exclude_paths".to_string(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join(LayoutConfig::DB_FILENAME)
    }

    pub fn pins_path(&self) -> PathBuf {
        self.state_dir.join(LayoutConfig::PINS_FILENAME)
    }
}
