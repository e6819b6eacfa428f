//! Durable mapping from logical path to the drive that holds it.

use super::path::LogicalPath;
use super::record::{PlacementRecord, PlacementState};
use crate::drives::{DriveId, Tier};
use crate::migration::Fingerprint;
use crate::store::{decode, decode_time, StateStore};
use crate::{Result, TierError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::debug;

const PLACEMENT_COLUMNS: &str =
    "path, drive_id, tier, size, fingerprint, state, task_id, modified_at, observed_at";

/// Files and bytes recorded on one drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveUsage {
    pub files: u64,
    pub bytes: u64,
}

/// The Placement Index.
///
/// Exactly one record per logical path. A record is only moved between
/// drives by a migration that first claimed it with
/// [`begin_migration`](Self::begin_migration), or by the reconciler when it
/// observes an external write.
#[derive(Clone)]
pub struct PlacementIndex {
    store: StateStore,
}

impl PlacementIndex {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn get(&self, path: &LogicalPath) -> Result<Option<PlacementRecord>> {
        let conn = self.store.lock_conn()?;
        get_in(&conn, path)
    }

    /// Point-in-time copy of every record, ordered by path.
    pub fn snapshot(&self) -> Result<Vec<PlacementRecord>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM placements ORDER BY path",
            PLACEMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn on_drive(&self, drive_id: &DriveId) -> Result<Vec<PlacementRecord>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM placements WHERE drive_id = ?1 ORDER BY path",
            PLACEMENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![drive_id.as_str()], record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn usage_by_drive(&self) -> Result<HashMap<DriveId, DriveUsage>> {
        let conn = self.store.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT drive_id, COUNT(*), SUM(size) FROM placements GROUP BY drive_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                DriveId::new(row.get::<_, String>(0)?),
                DriveUsage {
                    files: row.get::<_, i64>(1)? as u64,
                    bytes: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                },
            ))
        })?;

        let mut usage = HashMap::new();
        for row in rows {
            let (drive, entry) = row?;
            usage.insert(drive, entry);
        }
        Ok(usage)
    }

    /// Insert a record for a newly observed file. Returns `false` when the
    /// path already has one.
    pub fn insert_observed(&self, record: &PlacementRecord) -> Result<bool> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO placements
                 (path, drive_id, tier, size, fingerprint, state, task_id, modified_at, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.path.as_str(),
                record.drive_id.as_str(),
                record.tier.as_str(),
                record.size as i64,
                record.fingerprint.as_ref().map(|f| f.to_string()),
                record.state.as_str(),
                record.task_id,
                record.modified_at,
                record.observed_at.to_rfc3339(),
            ],
        )?;
        if rows > 0 {
            debug!("Observed new file {} on {}", record.path, record.drive_id);
        }
        Ok(rows > 0)
    }

    /// Apply a write made outside the engine: the file changed size or
    /// mtime, or now lives on another drive. Drops the stale fingerprint.
    ///
    /// Only applies while the record is still on `from`, the drive it was
    /// read on; records owned by a migration are left alone.
    pub fn record_external_write(
        &self,
        path: &LogicalPath,
        from: &DriveId,
        drive_id: &DriveId,
        tier: Tier,
        size: u64,
        modified_at: i64,
    ) -> Result<bool> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "UPDATE placements
             SET drive_id = ?1, tier = ?2, size = ?3, modified_at = ?4, fingerprint = NULL,
                 state = 'stable', observed_at = ?5
             WHERE path = ?6 AND drive_id = ?7 AND state != 'migrating'",
            params![
                drive_id.as_str(),
                tier.as_str(),
                size as i64,
                modified_at,
                Utc::now().to_rfc3339(),
                path.as_str(),
                from.as_str(),
            ],
        )?;
        Ok(rows > 0)
    }

    /// Remove the record of a deleted file, unless a migration owns it or
    /// it has since moved off `from`.
    pub fn remove(&self, path: &LogicalPath, from: &DriveId) -> Result<bool> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM placements WHERE path = ?1 AND drive_id = ?2 AND state != 'migrating'",
            params![path.as_str(), from.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// stable → orphaned.
    pub fn mark_orphaned(&self, path: &LogicalPath) -> Result<bool> {
        self.transition(path, PlacementState::Stable, PlacementState::Orphaned)
    }

    /// orphaned → stable, once the drive is back.
    pub fn restore(&self, path: &LogicalPath) -> Result<bool> {
        self.transition(path, PlacementState::Orphaned, PlacementState::Stable)
    }

    fn transition(
        &self,
        path: &LogicalPath,
        from: PlacementState,
        to: PlacementState,
    ) -> Result<bool> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "UPDATE placements SET state = ?1 WHERE path = ?2 AND state = ?3",
            params![to.as_str(), path.as_str(), from.as_str()],
        )?;
        Ok(rows > 0)
    }

    pub fn set_fingerprint(&self, path: &LogicalPath, fingerprint: &Fingerprint) -> Result<()> {
        let conn = self.store.lock_conn()?;
        conn.execute(
            "UPDATE placements SET fingerprint = ?1 WHERE path = ?2",
            params![fingerprint.to_string(), path.as_str()],
        )?;
        Ok(())
    }

    /// Claim a stable record on `source` for a migration task.
    ///
    /// Idempotent for the task that already owns the record. Any other state
    /// is an `InconsistentPlacement`.
    pub fn begin_migration(
        &self,
        path: &LogicalPath,
        task_id: &str,
        source: &DriveId,
    ) -> Result<PlacementRecord> {
        self.store.transaction(|tx| {
            let record = get_in(tx, path)?.ok_or_else(|| TierError::InconsistentPlacement {
                path: path.to_string(),
                message: "no placement record".to_string(),
            })?;

            if record.state == PlacementState::Migrating
                && record.task_id.as_deref() == Some(task_id)
            {
                return Ok(record);
            }
            if record.state != PlacementState::Stable || &record.drive_id != source {
                return Err(TierError::InconsistentPlacement {
                    path: path.to_string(),
                    message: format!(
                        "expected stable on {}, found {} on {}",
                        source, record.state, record.drive_id
                    ),
                });
            }

            tx.execute(
                "UPDATE placements SET state = 'migrating', task_id = ?1 WHERE path = ?2",
                params![task_id, path.as_str()],
            )?;
            Ok(PlacementRecord {
                state: PlacementState::Migrating,
                task_id: Some(task_id.to_string()),
                ..record
            })
        })
    }

    /// Release a claim without moving the record.
    pub fn abort_migration(&self, path: &LogicalPath, task_id: &str) -> Result<bool> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "UPDATE placements SET state = 'stable', task_id = NULL
             WHERE path = ?1 AND state = 'migrating' AND task_id = ?2",
            params![path.as_str(), task_id],
        )?;
        Ok(rows > 0)
    }
}

pub(crate) fn get_in(conn: &Connection, path: &LogicalPath) -> Result<Option<PlacementRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM placements WHERE path = ?1", PLACEMENT_COLUMNS),
            params![path.as_str()],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Move a claimed record to its destination. Runs inside the transaction
/// that also marks the task done.
pub(crate) fn complete_migration_in(
    conn: &Connection,
    path: &LogicalPath,
    task_id: &str,
    dest: &DriveId,
    tier: Tier,
    fingerprint: &Fingerprint,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE placements
         SET drive_id = ?1, tier = ?2, fingerprint = ?3, state = 'stable', task_id = NULL,
             observed_at = ?4
         WHERE path = ?5 AND state = 'migrating' AND task_id = ?6",
        params![
            dest.as_str(),
            tier.as_str(),
            fingerprint.to_string(),
            Utc::now().to_rfc3339(),
            path.as_str(),
            task_id,
        ],
    )?;
    if rows == 0 {
        return Err(TierError::InconsistentPlacement {
            path: path.to_string(),
            message: format!("record is not claimed by task {}", task_id),
        });
    }
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PlacementRecord> {
    let path: String = row.get(0)?;
    let tier: String = row.get(2)?;
    let fingerprint: Option<String> = row.get(4)?;
    let state: String = row.get(5)?;
    let observed_at: String = row.get(8)?;

    Ok(PlacementRecord {
        path: decode(0, &path, LogicalPath::new(&path).ok())?,
        drive_id: DriveId::new(row.get::<_, String>(1)?),
        tier: decode(2, &tier, Tier::parse(&tier))?,
        size: row.get::<_, i64>(3)? as u64,
        fingerprint: match fingerprint {
            Some(raw) => Some(decode(4, &raw, raw.parse().ok())?),
            None => None,
        },
        state: decode(5, &state, PlacementState::parse(&state))?,
        task_id: row.get(6)?,
        modified_at: row.get(7)?,
        observed_at: decode_time(8, &observed_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::FingerprintAlgorithm;

    fn path(p: &str) -> LogicalPath {
        LogicalPath::new(p).unwrap()
    }

    fn fp(digest: &str) -> Fingerprint {
        Fingerprint {
            algorithm: FingerprintAlgorithm::Blake3,
            digest: digest.to_string(),
        }
    }

    fn index_with(records: &[(&str, &str, Tier, u64)]) -> PlacementIndex {
        let index = PlacementIndex::new(StateStore::open_in_memory().unwrap());
        for (p, drive, tier, size) in records {
            index
                .insert_observed(&PlacementRecord::observed(
                    path(p),
                    DriveId::from(*drive),
                    *tier,
                    *size,
                    0,
                ))
                .unwrap();
        }
        index
    }

    #[test]
    fn test_one_record_per_path() {
        let index = index_with(&[("a/x", "fast1", Tier::Fast, 10)]);
        let again = PlacementRecord::observed(path("a/x"), DriveId::from("slow1"), Tier::Slow, 10, 0);
        assert!(!index.insert_observed(&again).unwrap());
        assert_eq!(index.get(&path("a/x")).unwrap().unwrap().drive_id.as_str(), "fast1");
        assert_eq!(index.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_migration_claim_is_exclusive() {
        let index = index_with(&[("f", "fast1", Tier::Fast, 10)]);
        let source = DriveId::from("fast1");

        index.begin_migration(&path("f"), "t1", &source).unwrap();
        // Same task resuming is fine.
        index.begin_migration(&path("f"), "t1", &source).unwrap();
        let err = index.begin_migration(&path("f"), "t2", &source).unwrap_err();
        assert!(matches!(err, TierError::InconsistentPlacement { .. }));
    }

    #[test]
    fn test_claim_requires_expected_drive() {
        let index = index_with(&[("f", "fast1", Tier::Fast, 10)]);
        assert!(index
            .begin_migration(&path("f"), "t1", &DriveId::from("other"))
            .is_err());
        assert!(index
            .begin_migration(&path("missing"), "t1", &DriveId::from("fast1"))
            .is_err());
    }

    #[test]
    fn test_complete_moves_record() {
        let store = StateStore::open_in_memory().unwrap();
        let index = PlacementIndex::new(store.clone());
        index
            .insert_observed(&PlacementRecord::observed(
                path("f"),
                DriveId::from("fast1"),
                Tier::Fast,
                10,
                0,
            ))
            .unwrap();
        index.begin_migration(&path("f"), "t1", &DriveId::from("fast1")).unwrap();

        store
            .transaction(|tx| {
                complete_migration_in(tx, &path("f"), "t1", &DriveId::from("slow1"), Tier::Slow, &fp("ab"))
            })
            .unwrap();

        let record = index.get(&path("f")).unwrap().unwrap();
        assert_eq!(record.drive_id.as_str(), "slow1");
        assert_eq!(record.tier, Tier::Slow);
        assert_eq!(record.state, PlacementState::Stable);
        assert_eq!(record.fingerprint, Some(fp("ab")));
        assert!(record.task_id.is_none());

        // A second completion finds no claim.
        assert!(store
            .transaction(|tx| {
                complete_migration_in(tx, &path("f"), "t1", &DriveId::from("slow1"), Tier::Slow, &fp("ab"))
            })
            .is_err());
    }

    #[test]
    fn test_abort_returns_to_stable() {
        let index = index_with(&[("f", "fast1", Tier::Fast, 10)]);
        index.begin_migration(&path("f"), "t1", &DriveId::from("fast1")).unwrap();
        assert!(!index.abort_migration(&path("f"), "other").unwrap());
        assert!(index.abort_migration(&path("f"), "t1").unwrap());
        assert!(index.get(&path("f")).unwrap().unwrap().is_stable());
    }

    #[test]
    fn test_migrating_records_are_protected() {
        let index = index_with(&[("f", "fast1", Tier::Fast, 10)]);
        index.begin_migration(&path("f"), "t1", &DriveId::from("fast1")).unwrap();

        let fast1 = DriveId::from("fast1");
        assert!(!index.remove(&path("f"), &fast1).unwrap());
        assert!(!index
            .record_external_write(&path("f"), &fast1, &fast1, Tier::Fast, 99, 5)
            .unwrap());
    }

    #[test]
    fn test_external_changes_need_current_drive() {
        let index = index_with(&[("f", "slow1", Tier::Slow, 10)]);
        let fast1 = DriveId::from("fast1");

        // Read on fast1 before a migration moved it to slow1.
        assert!(!index.remove(&path("f"), &fast1).unwrap());
        assert!(!index
            .record_external_write(&path("f"), &fast1, &fast1, Tier::Fast, 10, 1)
            .unwrap());
        let record = index.get(&path("f")).unwrap().unwrap();
        assert_eq!(record.drive_id.as_str(), "slow1");
        assert_eq!(record.tier, Tier::Slow);

        assert!(index.remove(&path("f"), &DriveId::from("slow1")).unwrap());
    }

    #[test]
    fn test_external_write_clears_fingerprint() {
        let index = index_with(&[("f", "fast1", Tier::Fast, 10)]);
        index.set_fingerprint(&path("f"), &fp("ab")).unwrap();
        index
            .record_external_write(
                &path("f"),
                &DriveId::from("fast1"),
                &DriveId::from("fast1"),
                Tier::Fast,
                20,
                7,
            )
            .unwrap();

        let record = index.get(&path("f")).unwrap().unwrap();
        assert_eq!(record.size, 20);
        assert_eq!(record.modified_at, 7);
        assert!(record.fingerprint.is_none());
    }

    #[test]
    fn test_orphan_round_trip_and_usage() {
        let index = index_with(&[
            ("a", "fast1", Tier::Fast, 10),
            ("b", "fast1", Tier::Fast, 5),
            ("c", "slow1", Tier::Slow, 7),
        ]);
        assert!(index.mark_orphaned(&path("a")).unwrap());
        assert!(!index.mark_orphaned(&path("a")).unwrap());
        assert!(index.restore(&path("a")).unwrap());

        let usage = index.usage_by_drive().unwrap();
        assert_eq!(usage[&DriveId::from("fast1")], DriveUsage { files: 2, bytes: 15 });
        assert_eq!(index.on_drive(&DriveId::from("slow1")).unwrap().len(), 1);
    }
}
