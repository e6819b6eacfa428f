//! Durable registry of physical drives.

use super::capacity::CapacityProbe;
use super::types::{Drive, DriveHealth, DriveId, Tier};
use crate::migration::task::PENDING_TASK_FILTER;
use crate::store::{decode, decode_time, StateStore};
use crate::{Result, TierError};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DRIVE_COLUMNS: &str = "id, mount_path, tier, total_bytes, free_bytes, health, device_path, \
                             fs_type, registered_at, refreshed_at";

/// Source of truth for which drives exist.
#[derive(Clone)]
pub struct DriveRegistry {
    store: StateStore,
    probe: Arc<dyn CapacityProbe>,
}

impl DriveRegistry {
    pub fn new(store: StateStore, probe: Arc<dyn CapacityProbe>) -> Self {
        Self { store, probe }
    }

    /// Register a drive.
    ///
    /// Re-registering the same id on the same mount path updates its tier and
    /// device details and keeps capacity and health. A conflicting id or mount
    /// path is a validation error.
    pub fn register(&self, drive: Drive) -> Result<Drive> {
        let mount = drive.mount_path.to_string_lossy().to_string();

        self.store.transaction(|tx| {
            let by_id: Option<String> = tx
                .query_row(
                    "SELECT mount_path FROM drives WHERE id = ?1",
                    params![drive.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let by_mount: Option<String> = tx
                .query_row(
                    "SELECT id FROM drives WHERE mount_path = ?1",
                    params![mount],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_mount) = &by_id {
                if existing_mount != &mount {
                    return Err(TierError::Validation {
                        field: "mount_path".to_string(),
                        message: format!(
                            "drive {} is already registered at {}",
                            drive.id, existing_mount
                        ),
                    });
                }
            }
            if let Some(existing_id) = &by_mount {
                if existing_id != drive.id.as_str() {
                    return Err(TierError::Validation {
                        field: "mount_path".to_string(),
                        message: format!("{} is already used by drive {}", mount, existing_id),
                    });
                }
            }

            let device = drive
                .device_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string());

            if by_id.is_some() {
                tx.execute(
                    "UPDATE drives SET tier = ?1, device_path = COALESCE(?2, device_path),
                         fs_type = COALESCE(?3, fs_type)
                     WHERE id = ?4",
                    params![drive.tier.as_str(), device, drive.fs_type, drive.id.as_str()],
                )?;
                debug!("Updated existing drive registration: {}", drive.id);
            } else {
                tx.execute(
                    "INSERT INTO drives (id, mount_path, tier, total_bytes, free_bytes, health,
                         device_path, fs_type, registered_at, refreshed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        drive.id.as_str(),
                        mount,
                        drive.tier.as_str(),
                        drive.total_bytes as i64,
                        drive.free_bytes as i64,
                        drive.health.as_str(),
                        device,
                        drive.fs_type,
                        drive.registered_at.to_rfc3339(),
                        drive.refreshed_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                info!(
                    "Registered {} drive {} at {}",
                    drive.tier,
                    drive.id,
                    drive.mount_path.display()
                );
            }
            Ok(())
        })?;

        self.require(&drive.id)
    }

    /// Remove a drive that no pending migration touches.
    pub fn deregister(&self, id: &DriveId) -> Result<()> {
        self.store.transaction(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM drives WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(TierError::DriveNotFound(id.to_string()));
            }

            let pending: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM tasks
                     WHERE (source_drive = ?1 OR dest_drive = ?1) AND {}",
                    PENDING_TASK_FILTER
                ),
                params![id.as_str()],
                |row| row.get(0),
            )?;
            if pending > 0 {
                return Err(TierError::DriveBusy {
                    drive_id: id.to_string(),
                    message: format!("{} pending migration(s) use this drive", pending),
                });
            }

            tx.execute("DELETE FROM drives WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        })?;

        info!("Deregistered drive {}", id);
        Ok(())
    }

    /// Re-sample capacity. A failed probe marks the drive offline.
    pub fn refresh_capacity(&self, id: &DriveId) -> Result<Drive> {
        let drive = self.require(id)?;

        match self.probe.probe(&drive.mount_path) {
            Ok(capacity) => {
                let health = if drive.health == DriveHealth::Offline {
                    info!("Drive {} is reachable again", id);
                    DriveHealth::Online
                } else {
                    drive.health
                };
                let conn = self.store.lock_conn()?;
                conn.execute(
                    "UPDATE drives SET total_bytes = ?1, free_bytes = ?2, health = ?3,
                         refreshed_at = ?4
                     WHERE id = ?5",
                    params![
                        capacity.total_bytes as i64,
                        capacity.free_bytes.min(capacity.total_bytes) as i64,
                        health.as_str(),
                        Utc::now().to_rfc3339(),
                        id.as_str(),
                    ],
                )?;
                drop(conn);
                self.require(id)
            }
            Err(e) => {
                if drive.health != DriveHealth::Offline {
                    warn!("Drive {} unreachable, marking offline: {}", id, e);
                }
                self.set_health(id, DriveHealth::Offline)?;
                Err(TierError::DriveUnreachable {
                    drive_id: id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Refresh every drive; one failure does not stop the others.
    pub fn refresh_all(&self) -> Result<Vec<(DriveId, Result<Drive>)>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|drive| {
                let outcome = self.refresh_capacity(&drive.id);
                (drive.id, outcome)
            })
            .collect())
    }

    /// All drives, fastest tier first, then by id.
    pub fn list(&self) -> Result<Vec<Drive>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM drives", DRIVE_COLUMNS))?;
        let rows = stmt.query_map([], drive_from_row)?;

        let mut drives = Vec::new();
        for row in rows {
            drives.push(row?);
        }
        drives.sort_by(|a, b| (a.tier, &a.id).cmp(&(b.tier, &b.id)));
        Ok(drives)
    }

    pub fn get(&self, id: &DriveId) -> Result<Option<Drive>> {
        let conn = self.store.lock_conn()?;
        let drive = conn
            .query_row(
                &format!("SELECT {} FROM drives WHERE id = ?1", DRIVE_COLUMNS),
                params![id.as_str()],
                drive_from_row,
            )
            .optional()?;
        Ok(drive)
    }

    /// Like [`get`](Self::get) but unknown ids are `DriveNotFound`.
    pub fn require(&self, id: &DriveId) -> Result<Drive> {
        self.get(id)?
            .ok_or_else(|| TierError::DriveNotFound(id.to_string()))
    }

    pub fn set_health(&self, id: &DriveId, health: DriveHealth) -> Result<Drive> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "UPDATE drives SET health = ?1 WHERE id = ?2",
            params![health.as_str(), id.as_str()],
        )?;
        drop(conn);
        if rows == 0 {
            return Err(TierError::DriveNotFound(id.to_string()));
        }
        self.require(id)
    }

    /// Online drives of one tier.
    pub fn online_in_tier(&self, tier: Tier) -> Result<Vec<Drive>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|d| d.tier == tier && d.is_online())
            .collect())
    }

    /// Fresh capacity sample without touching the registry.
    pub fn probe_free_bytes(&self, drive: &Drive) -> Result<u64> {
        self.probe
            .probe(&drive.mount_path)
            .map(|c| c.free_bytes)
            .map_err(|e| TierError::DriveUnreachable {
                drive_id: drive.id.to_string(),
                message: e.to_string(),
            })
    }
}

fn drive_from_row(row: &Row<'_>) -> rusqlite::Result<Drive> {
    let tier: String = row.get(2)?;
    let health: String = row.get(5)?;
    let registered_at: String = row.get(8)?;
    let refreshed_at: Option<String> = row.get(9)?;

    Ok(Drive {
        id: DriveId::new(row.get::<_, String>(0)?),
        mount_path: PathBuf::from(row.get::<_, String>(1)?),
        tier: decode(2, &tier, Tier::parse(&tier))?,
        total_bytes: row.get::<_, i64>(3)? as u64,
        free_bytes: row.get::<_, i64>(4)? as u64,
        health: decode(5, &health, DriveHealth::parse(&health))?,
        device_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        fs_type: row.get(7)?,
        registered_at: decode_time(8, &registered_at)?,
        refreshed_at: refreshed_at.map(|t| decode_time(9, &t)).transpose()?,
    })
}
