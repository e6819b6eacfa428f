//! Periodic sampling of access sources into decayed temperatures.

use super::decay::DecayModel;
use super::source::{AccessEvent, AccessSource};
use crate::cancel::CancellationToken;
use crate::drives::DriveId;
use crate::index::{LogicalPath, PlacementIndex};
use crate::store::StateStore;
use crate::{Result, TierError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stored temperature of one path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureEntry {
    pub path: LogicalPath,
    pub score: f64,
    pub scored_at: i64,
    pub last_access: i64,
    pub access_count: u64,
}

/// Temperatures evaluated at one instant.
#[derive(Debug, Clone, Default)]
pub struct TemperatureSnapshot {
    pub files: HashMap<LogicalPath, f64>,
    /// Sum of the temperatures of files placed on each drive.
    pub drives: HashMap<DriveId, f64>,
}

impl TemperatureSnapshot {
    /// Paths never accessed are at zero.
    pub fn file(&self, path: &LogicalPath) -> f64 {
        self.files.get(path).copied().unwrap_or(0.0)
    }

    pub fn drive(&self, id: &DriveId) -> f64 {
        self.drives.get(id).copied().unwrap_or(0.0)
    }
}

/// Outcome of one [`TemperatureSampler::sample_once`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleReport {
    pub applied: usize,
    pub dropped: usize,
    pub failed_sources: usize,
}

/// Collects access events and keeps per-path temperatures.
///
/// Read-only with respect to the Placement Index.
#[derive(Clone)]
pub struct TemperatureSampler {
    store: StateStore,
    index: PlacementIndex,
    sources: Vec<Arc<dyn AccessSource>>,
    decay: DecayModel,
}

impl TemperatureSampler {
    pub fn new(
        store: StateStore,
        index: PlacementIndex,
        sources: Vec<Arc<dyn AccessSource>>,
        half_life: Duration,
    ) -> Self {
        Self {
            store,
            index,
            sources,
            decay: DecayModel::new(half_life),
        }
    }

    /// Read every source once and apply its events.
    ///
    /// Events and the source's new watermark are committed together, so a
    /// crash between them cannot double count.
    pub async fn sample_once(&self) -> Result<SampleReport> {
        let mut report = SampleReport::default();

        for source in &self.sources {
            let name = source.name().to_string();
            let watermark = self.watermark(&name)?;

            let reader = Arc::clone(source);
            let batch = tokio::task::spawn_blocking(move || reader.read_since(watermark))
                .await
                .map_err(|e| TierError::Other(format!("Sampler task failed: {}", e)))?;

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Access source {} failed: {}", name, e);
                    report.failed_sources += 1;
                    continue;
                }
            };

            report.dropped += batch.dropped;
            let applied = batch.events.len();
            self.store.transaction(|tx| {
                for event in &batch.events {
                    apply_event(tx, &self.decay, event)?;
                }
                tx.execute(
                    "INSERT INTO watermarks (source, position) VALUES (?1, ?2)
                     ON CONFLICT(source) DO UPDATE SET position = excluded.position",
                    params![name, batch.watermark],
                )?;
                Ok(())
            })?;
            report.applied += applied;
            debug!("Applied {} access events from {}", applied, name);
        }

        Ok(report)
    }

    /// Record accesses directly, bypassing the sources.
    pub fn record(&self, events: &[AccessEvent]) -> Result<()> {
        self.store.transaction(|tx| {
            for event in events {
                apply_event(tx, &self.decay, event)?;
            }
            Ok(())
        })
    }

    /// Evaluate every temperature at `now` (unix seconds).
    pub fn snapshot(&self, now: i64) -> Result<TemperatureSnapshot> {
        let mut snapshot = TemperatureSnapshot::default();
        for entry in self.entries()? {
            let value = self.decay.value_at(entry.score, entry.scored_at, now);
            snapshot.files.insert(entry.path, value);
        }
        for record in self.index.snapshot()? {
            let value = snapshot.file(&record.path);
            *snapshot.drives.entry(record.drive_id).or_insert(0.0) += value;
        }
        Ok(snapshot)
    }

    pub fn entries(&self) -> Result<Vec<TemperatureEntry>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT path, score, scored_at, last_access, access_count
             FROM temperatures ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (path, score, scored_at, last_access, access_count) = row?;
            match LogicalPath::new(&path) {
                Ok(path) => entries.push(TemperatureEntry {
                    path,
                    score,
                    scored_at,
                    last_access,
                    access_count: access_count as u64,
                }),
                Err(e) => warn!("Ignoring stored temperature for invalid path: {}", e),
            }
        }
        Ok(entries)
    }

    /// Drop the temperature of a deleted path.
    pub fn forget(&self, path: &LogicalPath) -> Result<bool> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM temperatures WHERE path = ?1",
            params![path.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// Sample every `interval` until cancelled.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!("Temperature sampler started (interval {:?})", interval);
        loop {
            match self.sample_once().await {
                Ok(report) if report.applied > 0 || report.dropped > 0 => {
                    info!(
                        "Sampled {} access events ({} dropped)",
                        report.applied, report.dropped
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Temperature sampling failed: {}", e),
            }
            if !cancel.sleep(interval).await {
                break;
            }
        }
        info!("Temperature sampler stopped");
    }

    fn watermark(&self, source: &str) -> Result<i64> {
        let conn = self.store.lock_conn()?;
        let position = conn
            .query_row(
                "SELECT position FROM watermarks WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.unwrap_or(0))
    }
}

fn apply_event(conn: &Connection, decay: &DecayModel, event: &AccessEvent) -> Result<()> {
    let existing: Option<(f64, i64, i64, i64)> = conn
        .query_row(
            "SELECT score, scored_at, last_access, access_count FROM temperatures WHERE path = ?1",
            params![event.path.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let (score, scored_at, last_access, count) = existing.unwrap_or((0.0, event.at, 0, 0));
    let (score, scored_at) = decay.record_access(score, scored_at, event.at);

    conn.execute(
        "INSERT INTO temperatures (path, score, scored_at, last_access, access_count)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET score = excluded.score, scored_at = excluded.scored_at,
             last_access = excluded.last_access, access_count = excluded.access_count",
        params![
            event.path.as_str(),
            score,
            scored_at,
            last_access.max(event.at),
            count + 1,
        ],
    )?;
    Ok(())
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
