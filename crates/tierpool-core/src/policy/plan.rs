use crate::drives::{DriveId, Tier};
use crate::index::LogicalPath;
use crate::migration::{MigrationReason, MigrationTask};
use crate::TierError;
use serde::Serialize;

/// One migration chosen by a policy cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedMove {
    pub path: LogicalPath,
    pub source: DriveId,
    pub dest: DriveId,
    pub from_tier: Tier,
    pub to_tier: Tier,
    pub size: u64,
    pub temperature: f64,
    pub reason: MigrationReason,
}

impl PlannedMove {
    pub fn into_task(self) -> MigrationTask {
        MigrationTask::new(self.path, self.source, self.dest, self.size, self.reason)
    }
}

/// A candidate that could not be placed this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub path: LogicalPath,
    pub to_tier: Tier,
    pub needed: u64,
    /// Largest projected free space among the tier's eligible drives.
    pub available: u64,
    /// Best candidate drive, when the tier has any.
    pub drive_id: Option<DriveId>,
}

impl Rejection {
    pub fn to_error(&self) -> TierError {
        TierError::CapacityExceeded {
            drive_id: self
                .drive_id
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| format!("tier:{}", self.to_tier)),
            needed: self.needed,
            available: self.available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    Orphaned,
    MigratingWithoutTask,
    UnknownDrive,
    TemperatureWithoutRecord,
}

/// A path skipped because its bookkeeping is inconsistent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedPath {
    pub path: LogicalPath,
    pub reason: FlagReason,
}

/// Output of one policy cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub moves: Vec<PlannedMove>,
    pub rejections: Vec<Rejection>,
    pub flagged: Vec<FlaggedPath>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Bytes written to each destination drive.
    pub fn writes_per_drive(&self) -> std::collections::HashMap<DriveId, u64> {
        let mut writes = std::collections::HashMap::new();
        for m in &self.moves {
            *writes.entry(m.dest.clone()).or_insert(0) += m.size;
        }
        writes
    }
}
