//! Durable migration tasks.
//!
//! A task's phase is written before the phase's work starts, so after a
//! crash the stored phase names the step to redo.

use super::fingerprint::Fingerprint;
use crate::drives::DriveId;
use crate::index::LogicalPath;
use crate::store::{decode, decode_time, StateStore};
use crate::{Result, TierError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL predicate matching tasks that still hold a claim on their drives and
/// path: not yet terminal, or failed but waiting to be retried.
pub(crate) const PENDING_TASK_FILTER: &str = "dismissed = 0 AND \
     (phase NOT IN ('done', 'failed') OR (phase = 'failed' AND failure = 'retryable'))";

/// SQL predicate matching tasks that keep their path out of planning:
/// pending ones plus undismissed exhausted failures.
pub(crate) const BLOCKING_TASK_FILTER: &str = "dismissed = 0 AND \
     (phase NOT IN ('done', 'failed') OR (phase = 'failed' AND failure IN ('retryable', 'exhausted')))";

const TASK_COLUMNS: &str = "id, path, source_drive, dest_drive, size, reason, phase, failure, \
                            attempts, source_fingerprint, not_before, last_error, dismissed, \
                            created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Planned,
    Copying,
    Verifying,
    Swapping,
    Cleaning,
    Done,
    Failed,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Planned => "planned",
            TaskPhase::Copying => "copying",
            TaskPhase::Verifying => "verifying",
            TaskPhase::Swapping => "swapping",
            TaskPhase::Cleaning => "cleaning",
            TaskPhase::Done => "done",
            TaskPhase::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(TaskPhase::Planned),
            "copying" => Some(TaskPhase::Copying),
            "verifying" => Some(TaskPhase::Verifying),
            "swapping" => Some(TaskPhase::Swapping),
            "cleaning" => Some(TaskPhase::Cleaning),
            "done" => Some(TaskPhase::Done),
            "failed" => Some(TaskPhase::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Done | TaskPhase::Failed)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task failed, which decides what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Re-armed by the dispatcher once its backoff elapses.
    Retryable,
    /// Out of attempts; waits for the operator.
    Exhausted,
    /// The source vanished or changed; the reconciler re-observes the path.
    Abandoned,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Exhausted => "exhausted",
            FailureKind::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retryable" => Some(FailureKind::Retryable),
            "exhausted" => Some(FailureKind::Exhausted),
            "abandoned" => Some(FailureKind::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationReason {
    Promote,
    Demote,
}

impl MigrationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationReason::Promote => "promote",
            MigrationReason::Demote => "demote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "promote" => Some(MigrationReason::Promote),
            "demote" => Some(MigrationReason::Demote),
            _ => None,
        }
    }
}

/// One migration of one path between two drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub id: String,
    pub path: LogicalPath,
    pub source: DriveId,
    pub dest: DriveId,
    pub size: u64,
    pub reason: MigrationReason,
    pub phase: TaskPhase,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    pub source_fingerprint: Option<Fingerprint>,
    /// Unix seconds before which the task must not run.
    pub not_before: i64,
    pub last_error: Option<String>,
    pub dismissed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationTask {
    pub fn new(
        path: LogicalPath,
        source: DriveId,
        dest: DriveId,
        size: u64,
        reason: MigrationReason,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            source,
            dest,
            size,
            reason,
            phase: TaskPhase::Planned,
            failure: None,
            attempts: 0,
            source_fingerprint: None,
            not_before: 0,
            last_error: None,
            dismissed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.dismissed
            && (!self.phase.is_terminal() || self.failure == Some(FailureKind::Retryable))
    }
}

/// Persistent arena of migration tasks addressed by id.
#[derive(Clone)]
pub struct TaskStore {
    store: StateStore,
}

impl TaskStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Insert planned tasks, skipping any whose path already has a blocking
    /// task. Returns the tasks actually inserted.
    pub fn insert_planned(&self, tasks: Vec<MigrationTask>) -> Result<Vec<MigrationTask>> {
        self.store.transaction(|tx| {
            let mut inserted = Vec::new();
            for task in tasks {
                let blocked: i64 = tx.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM tasks WHERE path = ?1 AND {}",
                        BLOCKING_TASK_FILTER
                    ),
                    params![task.path.as_str()],
                    |row| row.get(0),
                )?;
                if blocked > 0 {
                    continue;
                }
                insert_in(tx, &task)?;
                inserted.push(task);
            }
            Ok(inserted)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<MigrationTask>> {
        let conn = self.store.lock_conn()?;
        get_in(&conn, id)
    }

    pub fn require(&self, id: &str) -> Result<MigrationTask> {
        self.get(id)?
            .ok_or_else(|| TierError::TaskNotFound(id.to_string()))
    }

    /// Every task, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationTask>> {
        self.query("1 = 1", params![])
    }

    /// Tasks that have not reached a terminal phase.
    pub fn active(&self) -> Result<Vec<MigrationTask>> {
        self.query("phase NOT IN ('done', 'failed')", params![])
    }

    /// Failed tasks still shown to the operator.
    pub fn failed(&self) -> Result<Vec<MigrationTask>> {
        self.query("phase = 'failed' AND dismissed = 0", params![])
    }

    /// Non-terminal tasks whose backoff has elapsed. Besides planned tasks
    /// this includes ones deferred mid-swap or mid-cleanup.
    pub fn runnable(&self, now: i64) -> Result<Vec<MigrationTask>> {
        self.query(
            "phase NOT IN ('done', 'failed') AND dismissed = 0 AND not_before <= ?1",
            params![now],
        )
    }

    /// Paths that the policy must not plan for.
    pub fn blocked_paths(&self) -> Result<Vec<LogicalPath>> {
        Ok(self
            .query(BLOCKING_TASK_FILTER, params![])?
            .into_iter()
            .map(|t| t.path)
            .collect())
    }

    /// Non-terminal tasks in a given phase.
    pub fn in_phase(&self, phase: TaskPhase) -> Result<Vec<MigrationTask>> {
        self.query("phase = ?1", params![phase.as_str()])
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<MigrationTask>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE {} ORDER BY created_at, id",
            TASK_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(args, task_from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Persist a phase before acting on it.
    pub fn set_phase(&self, id: &str, phase: TaskPhase) -> Result<()> {
        let conn = self.store.lock_conn()?;
        set_phase_in(&conn, id, phase)
    }

    pub fn set_source_fingerprint(&self, id: &str, fingerprint: &Fingerprint) -> Result<()> {
        self.update(
            id,
            "source_fingerprint = ?1",
            params![fingerprint.to_string(), id],
        )
    }

    /// Back to planned without spending an attempt (lock contention,
    /// capacity re-check).
    pub fn requeue(&self, id: &str, not_before: i64, reason: &str) -> Result<()> {
        self.update(
            id,
            "phase = 'planned', failure = NULL, not_before = ?1, last_error = ?2",
            params![not_before, reason, id],
        )
    }

    /// Postpone a task without leaving its phase. Used past the swap point,
    /// where rolling back to planned would lose the new copy.
    pub fn defer(&self, id: &str, not_before: i64, reason: &str) -> Result<()> {
        self.update(
            id,
            "not_before = ?1, last_error = ?2",
            params![not_before, reason, id],
        )
    }

    /// Record a failed attempt.
    pub fn fail(
        &self,
        id: &str,
        kind: FailureKind,
        attempts: u32,
        not_before: i64,
        error: &str,
    ) -> Result<()> {
        self.update(
            id,
            "phase = 'failed', failure = ?1, attempts = ?2, not_before = ?3, last_error = ?4",
            params![kind.as_str(), attempts, not_before, error, id],
        )
    }

    /// Re-arm retryable failures whose backoff elapsed. Returns how many.
    pub fn rearm_due(&self, now: i64) -> Result<usize> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "UPDATE tasks SET phase = 'planned', failure = NULL, updated_at = ?1
             WHERE phase = 'failed' AND failure = 'retryable' AND dismissed = 0
               AND not_before <= ?2",
            params![Utc::now().to_rfc3339(), now],
        )?;
        Ok(rows)
    }

    /// Operator retry: re-arm a failed task with a fresh attempt budget.
    pub fn retry(&self, id: &str) -> Result<MigrationTask> {
        let task = self.require(id)?;
        if task.phase != TaskPhase::Failed {
            return Err(TierError::Validation {
                field: "task".to_string(),
                message: format!("task {} is {}, not failed", id, task.phase),
            });
        }
        self.store.transaction(|tx| {
            let blocked: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM tasks WHERE path = ?1 AND id != ?2 AND {}",
                    BLOCKING_TASK_FILTER
                ),
                params![task.path.as_str(), id],
                |row| row.get(0),
            )?;
            if blocked > 0 {
                return Err(TierError::PathLocked {
                    path: task.path.to_string(),
                });
            }
            tx.execute(
                "UPDATE tasks SET phase = 'planned', failure = NULL, attempts = 0, not_before = 0,
                     dismissed = 0, updated_at = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })?;
        self.require(id)
    }

    /// Operator dismiss: hide a failed task from the active set.
    pub fn dismiss(&self, id: &str) -> Result<MigrationTask> {
        let task = self.require(id)?;
        if task.phase != TaskPhase::Failed {
            return Err(TierError::Validation {
                field: "task".to_string(),
                message: format!("only failed tasks can be dismissed, {} is {}", id, task.phase),
            });
        }
        self.update(id, "dismissed = 1", params![id])?;
        self.require(id)
    }

    /// Delete finished history older than `before`.
    pub fn prune(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.store.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM tasks
             WHERE (phase = 'done' OR (phase = 'failed' AND dismissed = 1)) AND updated_at < ?1",
            params![before.to_rfc3339()],
        )?;
        Ok(rows)
    }

    /// Task counts per phase.
    pub fn phase_counts(&self) -> Result<Vec<(TaskPhase, u64)>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare("SELECT phase, COUNT(*) FROM tasks GROUP BY phase")?;
        let rows = stmt.query_map([], |row| {
            let phase: String = row.get(0)?;
            Ok((decode(0, &phase, TaskPhase::parse(&phase))?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// `set` must use positional parameters with the task id last.
    fn update(&self, id: &str, set: &str, args: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let conn = self.store.lock_conn()?;
        let id_param = args.len();
        let sql = format!(
            "UPDATE tasks SET {}, updated_at = '{}' WHERE id = ?{}",
            set,
            Utc::now().to_rfc3339(),
            id_param
        );
        let rows = conn.execute(&sql, args)?;
        if rows == 0 {
            return Err(TierError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }
}

pub(crate) fn insert_in(conn: &Connection, task: &MigrationTask) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            TASK_COLUMNS
        ),
        params![
            task.id,
            task.path.as_str(),
            task.source.as_str(),
            task.dest.as_str(),
            task.size as i64,
            task.reason.as_str(),
            task.phase.as_str(),
            task.failure.map(|f| f.as_str()),
            task.attempts,
            task.source_fingerprint.as_ref().map(|f| f.to_string()),
            task.not_before,
            task.last_error,
            task.dismissed,
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_in(conn: &Connection, id: &str) -> Result<Option<MigrationTask>> {
    let task = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

pub(crate) fn set_phase_in(conn: &Connection, id: &str, phase: TaskPhase) -> Result<()> {
    let rows = conn.execute(
        "UPDATE tasks SET phase = ?1, updated_at = ?2 WHERE id = ?3",
        params![phase.as_str(), Utc::now().to_rfc3339(), id],
    )?;
    if rows == 0 {
        return Err(TierError::TaskNotFound(id.to_string()));
    }
    Ok(())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationTask> {
    let path: String = row.get(1)?;
    let reason: String = row.get(5)?;
    let phase: String = row.get(6)?;
    let failure: Option<String> = row.get(7)?;
    let fingerprint: Option<String> = row.get(9)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(MigrationTask {
        id: row.get(0)?,
        path: decode(1, &path, LogicalPath::new(&path).ok())?,
        source: DriveId::new(row.get::<_, String>(2)?),
        dest: DriveId::new(row.get::<_, String>(3)?),
        size: row.get::<_, i64>(4)? as u64,
        reason: decode(5, &reason, MigrationReason::parse(&reason))?,
        phase: decode(6, &phase, TaskPhase::parse(&phase))?,
        failure: match failure {
            Some(raw) => Some(decode(7, &raw, FailureKind::parse(&raw))?),
            None => None,
        },
        attempts: row.get(8)?,
        source_fingerprint: match fingerprint {
            Some(raw) => Some(decode(9, &raw, raw.parse().ok())?),
            None => None,
        },
        not_before: row.get(10)?,
        last_error: row.get(11)?,
        dismissed: row.get(12)?,
        created_at: decode_time(13, &created_at)?,
        updated_at: decode_time(14, &updated_at)?,
    })
}
