//! Drive and tier types shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Storage tier, ordered fastest first.
///
/// Deserialization also accepts the `hot`/`warm`/`cold` names used by older
/// configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[serde(alias = "hot")]
    Fast,
    #[serde(alias = "warm")]
    Slow,
    #[serde(alias = "cold")]
    Archival,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Slow, Tier::Archival];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Slow => "slow",
            Tier::Archival => "archival",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fast" | "hot" => Some(Tier::Fast),
            "slow" | "warm" => Some(Tier::Slow),
            "archival" | "cold" => Some(Tier::Archival),
            _ => None,
        }
    }

    /// The next faster tier, if any.
    pub fn faster(&self) -> Option<Tier> {
        match self {
            Tier::Fast => None,
            Tier::Slow => Some(Tier::Fast),
            Tier::Archival => Some(Tier::Slow),
        }
    }

    /// The next slower tier, if any.
    pub fn slower(&self) -> Option<Tier> {
        match self {
            Tier::Fast => Some(Tier::Slow),
            Tier::Slow => Some(Tier::Archival),
            Tier::Archival => None,
        }
    }

    /// Every tier slower than this one, nearest first.
    pub fn slower_tiers(&self) -> Vec<Tier> {
        let mut tiers = Vec::new();
        let mut current = self.slower();
        while let Some(tier) = current {
            tiers.push(tier);
            current = tier.slower();
        }
        tiers
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable drive identifier (the device serial when provisioned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveId(String);

impl DriveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriveId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Drive health as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveHealth {
    Online,
    Degraded,
    Offline,
}

impl DriveHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveHealth::Online => "online",
            DriveHealth::Degraded => "degraded",
            DriveHealth::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(DriveHealth::Online),
            "degraded" => Some(DriveHealth::Degraded),
            "offline" => Some(DriveHealth::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for DriveHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered physical drive (point-in-time snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    pub id: DriveId,
    /// Root of the drive's mounted filesystem; one union branch.
    pub mount_path: PathBuf,
    pub tier: Tier,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub health: DriveHealth,
    /// Block device path when the drive came from provisioning.
    pub device_path: Option<PathBuf>,
    pub fs_type: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Drive {
    /// A new online drive with unknown capacity.
    pub fn new(id: impl Into<DriveId>, mount_path: impl Into<PathBuf>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            mount_path: mount_path.into(),
            tier,
            total_bytes: 0,
            free_bytes: 0,
            health: DriveHealth::Online,
            device_path: None,
            fs_type: None,
            registered_at: Utc::now(),
            refreshed_at: None,
        }
    }

    /// Builder-style capacity setter.
    pub fn with_capacity(mut self, total_bytes: u64, free_bytes: u64) -> Self {
        self.total_bytes = total_bytes;
        self.free_bytes = free_bytes.min(total_bytes);
        self
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn is_online(&self) -> bool {
        self.health == DriveHealth::Online
    }
}

impl From<String> for DriveId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
