//! Per-path exclusion for migrations.
//!
//! Acquisition never waits: a contended path fails with `PathLocked` and the
//! caller requeues. Entries exist only while a guard is alive.

use super::path::LogicalPath;
use crate::{Result, TierError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct PathLockTable {
    held: Arc<Mutex<HashSet<LogicalPath>>>,
}

impl PathLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, path: &LogicalPath) -> Result<PathGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| TierError::Other("path lock table poisoned".to_string()))?;
        if !held.insert(path.clone()) {
            return Err(TierError::PathLocked {
                path: path.to_string(),
            });
        }
        Ok(PathGuard {
            held: Arc::clone(&self.held),
            path: path.clone(),
        })
    }

    pub fn is_locked(&self, path: &LogicalPath) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(path))
            .unwrap_or(false)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its path on drop.
#[derive(Debug)]
pub struct PathGuard {
    held: Arc<Mutex<HashSet<LogicalPath>>>,
    path: LogicalPath,
}

impl PathGuard {
    pub fn path(&self) -> &LogicalPath {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails_without_waiting() {
        let table = PathLockTable::new();
        let path = LogicalPath::new("a/b").unwrap();

        let guard = table.try_lock(&path).unwrap();
        assert!(matches!(
            table.try_lock(&path),
            Err(TierError::PathLocked { .. })
        ));
        assert!(table.try_lock(&LogicalPath::new("a/c").unwrap()).is_ok());

        drop(guard);
        assert!(table.try_lock(&path).is_ok());
    }

    #[test]
    fn test_entries_reclaimed_on_release() {
        let table = PathLockTable::new();
        {
            let _a = table.try_lock(&LogicalPath::new("x").unwrap()).unwrap();
            let _b = table.try_lock(&LogicalPath::new("y").unwrap()).unwrap();
            assert_eq!(table.len(), 2);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_guards_shared_across_threads() {
        let table = PathLockTable::new();
        let path = LogicalPath::new("shared").unwrap();
        let guard = table.try_lock(&path).unwrap();

        let other = table.clone();
        let p = path.clone();
        let contended = std::thread::spawn(move || other.try_lock(&p).is_err())
            .join()
            .unwrap();
        assert!(contended);
        drop(guard);
        assert!(!table.is_locked(&path));
    }
}
