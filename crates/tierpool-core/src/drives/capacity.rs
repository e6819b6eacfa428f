//! Capacity sampling for drive mount points.

use crate::{Result, TierError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use sysinfo::Disks;

/// Total and free bytes of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Samples the capacity of a mounted drive.
pub trait CapacityProbe: Send + Sync {
    /// Fails when the mount is absent or cannot be queried.
    fn probe(&self, mount_path: &Path) -> Result<Capacity>;
}

/// `statvfs`-based probe.
///
/// With `require_mountpoint`, a path that is not the root of a mounted
/// filesystem is reported unreachable: an unmounted drive directory would
/// otherwise report the capacity of the filesystem underneath it.
#[derive(Debug, Clone, Default)]
pub struct StatvfsProbe {
    require_mountpoint: bool,
}

impl StatvfsProbe {
    pub fn new(require_mountpoint: bool) -> Self {
        Self { require_mountpoint }
    }

    fn is_mountpoint(path: &Path) -> bool {
        let disks = Disks::new_with_refreshed_list();
        disks.list().iter().any(|disk| disk.mount_point() == path)
    }
}

impl CapacityProbe for StatvfsProbe {
    fn probe(&self, mount_path: &Path) -> Result<Capacity> {
        if !mount_path.is_dir() {
            return Err(TierError::io_with_path(
                std::io::Error::new(std::io::ErrorKind::NotFound, "mount path missing"),
                mount_path,
            ));
        }
        if self.require_mountpoint && !Self::is_mountpoint(mount_path) {
            return Err(TierError::io_with_path(
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a mounted filesystem"),
                mount_path,
            ));
        }

        let stats = fs2::statvfs(mount_path).map_err(|e| TierError::io_with_path(e, mount_path))?;
        Ok(Capacity {
            total_bytes: stats.total_space(),
            free_bytes: stats.available_space(),
        })
    }
}

/// Probe answering from a table of declared capacities.
///
/// Used for simulations and dry runs where drive sizes are modelled rather
/// than measured; paths without an entry are unreachable.
#[derive(Debug, Default)]
pub struct ManualCapacityProbe {
    capacities: RwLock<HashMap<PathBuf, Capacity>>,
}

impl ManualCapacityProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, mount_path: impl Into<PathBuf>, total_bytes: u64, free_bytes: u64) {
        if let Ok(mut capacities) = self.capacities.write() {
            capacities.insert(
                mount_path.into(),
                Capacity {
                    total_bytes,
                    free_bytes: free_bytes.min(total_bytes),
                },
            );
        }
    }

    /// Adjust the free space of a path by a signed delta.
    pub fn adjust_free(&self, mount_path: &Path, delta: i64) {
        if let Ok(mut capacities) = self.capacities.write() {
            if let Some(capacity) = capacities.get_mut(mount_path) {
                let free = capacity.free_bytes as i64 + delta;
                capacity.free_bytes = free.clamp(0, capacity.total_bytes as i64) as u64;
            }
        }
    }

    pub fn remove(&self, mount_path: &Path) {
        if let Ok(mut capacities) = self.capacities.write() {
            capacities.remove(mount_path);
        }
    }
}

impl CapacityProbe for ManualCapacityProbe {
    fn probe(&self, mount_path: &Path) -> Result<Capacity> {
        let capacities = self
            .capacities
            .read()
            .map_err(|_| TierError::Other("capacity table poisoned".to_string()))?;
        capacities.get(mount_path).copied().ok_or_else(|| {
            TierError::io_with_path(
                std::io::Error::new(std::io::ErrorKind::NotFound, "no capacity declared"),
                mount_path,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_statvfs_probe_reports_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let capacity = StatvfsProbe::new(false).probe(temp_dir.path()).unwrap();
        assert!(capacity.total_bytes > 0);
        assert!(capacity.free_bytes <= capacity.total_bytes);
    }

    #[test]
    fn test_statvfs_probe_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        let err = StatvfsProbe::new(false)
            .probe(&temp_dir.path().join("absent"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_statvfs_probe_requires_mountpoint() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("not-a-mount");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(StatvfsProbe::new(true).probe(&nested).is_err());
    }

    #[test]
    fn test_manual_probe_adjust() {
        let probe = ManualCapacityProbe::new();
        probe.set("/mnt/a", 100, 40);
        probe.adjust_free(Path::new("/mnt/a"), 10);
        assert_eq!(probe.probe(Path::new("/mnt/a")).unwrap().free_bytes, 50);
        probe.adjust_free(Path::new("/mnt/a"), -500);
        assert_eq!(probe.probe(Path::new("/mnt/a")).unwrap().free_bytes, 0);
        assert!(probe.probe(Path::new("/mnt/b")).is_err());
    }
}
