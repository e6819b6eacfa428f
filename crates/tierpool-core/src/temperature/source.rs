//! Access event sources.
//!
//! Every source resumes from a monotonic watermark the sampler persists
//! together with the events it applied, so a source never delivers the same
//! access twice.

use crate::config::LayoutConfig;
use crate::drives::DriveRegistry;
use crate::index::LogicalPath;
use crate::{Result, TierError};
use serde::Deserialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One observed access to a logical path (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub path: LogicalPath,
    pub at: i64,
}

/// Events read since a watermark.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub events: Vec<AccessEvent>,
    /// Watermark to persist once the events are applied.
    pub watermark: i64,
    /// Entries that could not be turned into events.
    pub dropped: usize,
}

/// A producer of access events. Reads are blocking and run on the blocking
/// pool.
pub trait AccessSource: Send + Sync {
    /// Key of this source's watermark in the state store.
    fn name(&self) -> &str;

    fn read_since(&self, watermark: i64) -> Result<SourceBatch>;
}

#[derive(Debug, Deserialize)]
struct JournalLine {
    path: String,
    at: i64,
}

/// Append-only JSON-lines journal: `{"path": "...", "at": <unix secs>}`.
///
/// The watermark is the byte offset after the last complete line consumed.
pub struct JournalSource {
    path: PathBuf,
}

impl JournalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AccessSource for JournalSource {
    fn name(&self) -> &str {
        crate::config::TemperatureConfig::JOURNAL_WATERMARK
    }

    fn read_since(&self, watermark: i64) -> Result<SourceBatch> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourceBatch {
                    watermark,
                    ..Default::default()
                })
            }
            Err(e) => return Err(TierError::io_with_path(e, &self.path)),
        };

        let len = file
            .metadata()
            .map_err(|e| TierError::io_with_path(e, &self.path))?
            .len();
        let mut offset = watermark.max(0) as u64;
        if len < offset {
            warn!(
                "Access journal {} shrank below its watermark, rereading from the start",
                self.path.display()
            );
            offset = 0;
        }

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| TierError::io_with_path(e, &self.path))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| TierError::io_with_path(e, &self.path))?;

        // Only complete lines; a partial tail waits for the next sample.
        let consumed = match buffer.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };

        let mut batch = SourceBatch {
            watermark: (offset + consumed as u64) as i64,
            ..Default::default()
        };
        for line in buffer[..consumed].split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalLine>(line)
                .map_err(TierError::from)
                .and_then(|entry| Ok((LogicalPath::new(&entry.path)?, entry.at)))
            {
                Ok((path, at)) => batch.events.push(AccessEvent { path, at }),
                Err(e) => {
                    warn!("Skipping malformed journal line {:?}: {}", line, e);
                    batch.dropped += 1;
                }
            }
        }

        Ok(batch)
    }
}

/// Derives accesses from file atimes on every online drive.
///
/// The watermark is the newest atime seen; files accessed after it produce
/// one event at their atime.
pub struct AtimeSource {
    registry: DriveRegistry,
}

impl AtimeSource {
    pub fn new(registry: DriveRegistry) -> Self {
        Self { registry }
    }
}

impl AccessSource for AtimeSource {
    fn name(&self) -> &str {
        crate::config::TemperatureConfig::ATIME_WATERMARK
    }

    fn read_since(&self, watermark: i64) -> Result<SourceBatch> {
        let mut batch = SourceBatch {
            watermark,
            ..Default::default()
        };

        for drive in self.registry.list()?.into_iter().filter(|d| d.is_online()) {
            let root = drive.mount_path.clone();
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.depth() != 1 || e.file_name() != LayoutConfig::INTERNAL_DIR);

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                        batch.dropped += 1;
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(path) = LogicalPath::from_physical(&root, entry.path()) else {
                    continue;
                };
                let atime = match entry.metadata().ok().and_then(|m| m.accessed().ok()) {
                    Some(t) => t,
                    None => {
                        batch.dropped += 1;
                        continue;
                    }
                };
                let at = atime
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if at > watermark {
                    batch.events.push(AccessEvent { path, at });
                    batch.watermark = batch.watermark.max(at);
                }
            }
        }

        Ok(batch)
    }
}
