//! Union Namespace Controller.
//!
//! The engine only talks to the union through [`UnionNamespace`]; the
//! `mergerfs` mount itself is a black box driven by [`BranchUnion`].

mod branch;

pub use branch::BranchUnion;

use crate::drives::{Drive, DriveId, Tier};
use crate::index::LogicalPath;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A physical file backing a logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalLocation {
    pub drive_id: DriveId,
    pub path: PathBuf,
}

/// One union branch: a drive root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub drive_id: DriveId,
    pub root: PathBuf,
    pub tier: Tier,
}

impl Branch {
    /// Branches for every usable drive, fastest tier first.
    pub fn from_drives(drives: &[Drive]) -> Vec<Branch> {
        let mut branches: Vec<Branch> = drives
            .iter()
            .filter(|d| d.health != crate::drives::DriveHealth::Offline)
            .map(|d| Branch {
                drive_id: d.id.clone(),
                root: d.mount_path.clone(),
                tier: d.tier,
            })
            .collect();
        branches.sort_by(|a, b| (a.tier, &a.drive_id).cmp(&(b.tier, &b.drive_id)));
        branches
    }
}

#[async_trait]
pub trait UnionNamespace: Send + Sync {
    /// The single physical file a reader of `path` gets, if any.
    fn resolve(&self, path: &LogicalPath) -> Result<Option<PhysicalLocation>>;

    /// Make `drive`'s copy of `path` the one served.
    ///
    /// With `staged`, that file is first moved into its final place on the
    /// drive; without it, the final file must already exist. The durable
    /// switch happens last, so a crash leaves either the old or the new
    /// mapping visible.
    async fn set_priority(
        &self,
        path: &LogicalPath,
        drive: &DriveId,
        staged: Option<&Path>,
    ) -> Result<PhysicalLocation>;

    /// Forget the mapping override for `path` once only one copy remains.
    fn release(&self, path: &LogicalPath) -> Result<()>;

    async fn mount(&self, branches: Vec<Branch>) -> Result<()>;

    async fn unmount(&self) -> Result<()>;

    /// Replace the branch list without remounting.
    fn set_branches(&self, branches: Vec<Branch>);

    fn branches(&self) -> Vec<Branch>;

    /// Current mapping overrides.
    fn pins(&self) -> Vec<(LogicalPath, DriveId)> {
        Vec::new()
    }
}
