use super::path::LogicalPath;
use crate::drives::{DriveId, Tier};
use crate::migration::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a placement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementState {
    Stable,
    /// Owned by one migration task until it completes or aborts.
    Migrating,
    /// Its drive is offline or no longer registered.
    Orphaned,
}

impl PlacementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementState::Stable => "stable",
            PlacementState::Migrating => "migrating",
            PlacementState::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stable" => Some(PlacementState::Stable),
            "migrating" => Some(PlacementState::Migrating),
            "orphaned" => Some(PlacementState::Orphaned),
            _ => None,
        }
    }
}

impl fmt::Display for PlacementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which drive currently holds one logical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub path: LogicalPath,
    pub drive_id: DriveId,
    pub tier: Tier,
    pub size: u64,
    pub fingerprint: Option<Fingerprint>,
    pub state: PlacementState,
    pub task_id: Option<String>,
    /// File modification time in unix milliseconds when last observed.
    pub modified_at: i64,
    pub observed_at: DateTime<Utc>,
}

impl PlacementRecord {
    /// A freshly observed stable record.
    pub fn observed(
        path: LogicalPath,
        drive_id: DriveId,
        tier: Tier,
        size: u64,
        modified_at: i64,
    ) -> Self {
        Self {
            path,
            drive_id,
            tier,
            size,
            fingerprint: None,
            state: PlacementState::Stable,
            task_id: None,
            modified_at,
            observed_at: Utc::now(),
        }
    }

    pub fn is_stable(&self) -> bool {
        self.state == PlacementState::Stable
    }
}
