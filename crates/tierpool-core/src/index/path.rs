//! Logical paths inside the union namespace.

use crate::config::LayoutConfig;
use crate::{Result, TierError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A normalized, relative, `/`-separated path under the union root.
///
/// Never empty, never contains `..`, and never points into the engine's
/// internal directory on a drive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalPath(String);

impl LogicalPath {
    pub fn new(raw: &str) -> Result<Self> {
        let mut parts = Vec::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(invalid(raw, "must not escape the union root"));
                }
            }
        }
        if parts.is_empty() {
            return Err(invalid(raw, "empty path"));
        }
        if parts[0] == LayoutConfig::INTERNAL_DIR {
            return Err(invalid(raw, "internal directory"));
        }
        Ok(Self(parts.join("/")))
    }

    /// Logical path of a physical file below `root`, if it is a user file.
    pub fn from_physical(root: &Path, physical: &Path) -> Option<Self> {
        let relative = physical.strip_prefix(root).ok()?;
        Self::new(&relative.to_string_lossy()).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Where this path lives on a drive rooted at `root`.
    pub fn on_drive(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

fn invalid(raw: &str, message: &str) -> TierError {
    TierError::Validation {
        field: "path".to_string(),
        message: format!("{:?}: {}", raw, message),
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LogicalPath {
    type Error = TierError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<LogicalPath> for String {
    fn from(path: LogicalPath) -> Self {
        path.0
    }
}
