//! Atomic JSON persistence.
//!
//! Writes go to a temp file named with the PID and thread id, are fsynced and
//! then renamed over the target, so a reader sees either the old or the new
//! document and never a torn one. The parent directory is synced after the
//! rename so the new name itself survives a power loss.

use crate::{Result, TierError};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Read and parse a JSON file; `None` when it does not exist.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TierError::io_with_path(e, path)),
    };

    let data: T = serde_json::from_str(&contents).map_err(|e| TierError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write `data` to `path` atomically, optionally keeping the previous version
/// as `<name>.json.bak`.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| TierError::io_with_path(e, parent))?;
        }
    }

    let temp_path = path.with_extension(format!(
        "json.{}.{}.tmp",
        std::process::id(),
        thread_id()
    ));

    let serialized = serde_json::to_string_pretty(data).map_err(|e| TierError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| TierError::io_with_path(e, &temp_path))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| TierError::io_with_path(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| TierError::io_with_path(e, &temp_path))?;
    }

    if keep_backup && path.exists() {
        let backup_path = path.with_extension("json.bak");
        match fs::copy(path, &backup_path) {
            Ok(_) => debug!("Created backup: {}", backup_path.display()),
            Err(e) => warn!("Failed to create backup {}: {}", backup_path.display(), e),
        }
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(TierError::Io {
            message: format!("Failed to rename {} to {}", temp_path.display(), path.display()),
            path: Some(path.to_path_buf()),
            source: Some(e),
        });
    }

    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }

    Ok(())
}

/// Best-effort fsync of a directory entry table.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            debug!("Directory sync failed for {}: {}", dir.display(), e);
        }
    }
}

fn thread_id() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let value: Option<BTreeMap<String, String>> =
            atomic_read_json(&temp_dir.path().join("missing.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pins.json");

        let mut pins = BTreeMap::new();
        pins.insert("media/a.mkv".to_string(), "nvme0".to_string());
        atomic_write_json(&path, &pins, false).unwrap();

        let loaded: BTreeMap<String, String> = atomic_read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, pins);

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_backup_keeps_previous_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pins.json");

        atomic_write_json(&path, &vec![1], true).unwrap();
        atomic_write_json(&path, &vec![2], true).unwrap();

        let backup: Vec<i32> = atomic_read_json(&path.with_extension("json.bak"))
            .unwrap()
            .unwrap();
        assert_eq!(backup, vec![1]);
    }

    #[test]
    fn test_malformed_file_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, "{").unwrap();
        let result: Result<Option<Vec<i32>>> = atomic_read_json(&path);
        assert!(matches!(result, Err(TierError::Json { .. })));
    }
}
