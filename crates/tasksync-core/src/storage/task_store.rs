//! SQLite-backed local task store with deletion tombstones.
//!
//! Local mutations stamp `updated_at` from the injected clock, bump
//! `event_version` and hand back the [`SyncEvent`] describing the change.
//! Remote applies go through [`TaskStore::apply_remote_upsert`] and
//! [`TaskStore::apply_remote_delete`], which are idempotent and report stale
//! input through their boolean result only.
//!
//! Every check-then-write sequence runs inside one transaction.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::sync::device_id::NodeIdentity;
use crate::sync::event::SyncEvent;
use crate::sync::manifest::{compare_manifest, compare_versions, ManifestDiff, ManifestEntry};
use crate::task::{Task, TaskState};

const TASK_COLUMNS: &str = "id, user_id, device_id, title, description, tags, priority, due_at,
     state, snoozed_until, completed_at, event_version, created_at, updated_at";

/// Format a timestamp for storage.
///
/// Fixed-width nanosecond RFC3339 so that SQL string comparison orders the
/// same way as the timestamps themselves.
fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|v| parse_ts(idx, &v)).transpose()
}

/// Build a Task from a row selected with [`TASK_COLUMNS`].
fn row_to_task(row: &rusqlite::Row) -> Result<Task, rusqlite::Error> {
    let tags_json: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let state_str: String = row.get(8)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        tags,
        priority: row.get(6)?,
        due_at: parse_opt_ts(7, row.get(7)?)?,
        state: TaskState::parse(&state_str),
        snoozed_until: parse_opt_ts(9, row.get(9)?)?,
        completed_at: parse_opt_ts(10, row.get(10)?)?,
        event_version: row.get(11)?,
        created_at: parse_ts(12, &created_at)?,
        updated_at: parse_ts(13, &updated_at)?,
    })
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, StoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
}

/// `(event_version, updated_at)` of the stored row, if any.
fn load_version(conn: &Connection, id: &str) -> Result<Option<(i64, DateTime<Utc>)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT event_version, updated_at FROM tasks WHERE id = ?1",
            params![id],
            |row| {
                let version: i64 = row.get(0)?;
                let updated_at: String = row.get(1)?;
                Ok((version, parse_ts(1, &updated_at)?))
            },
        )
        .optional()?;
    Ok(row)
}

fn load_tombstone(conn: &Connection, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let row = conn
        .query_row(
            "SELECT deleted_at FROM tombstones WHERE task_id = ?1",
            params![id],
            |row| {
                let deleted_at: String = row.get(0)?;
                parse_ts(0, &deleted_at)
            },
        )
        .optional()?;
    Ok(row)
}

fn write_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let tags_json = serde_json::to_string(&task.tags)?;
    let sql = format!(
        "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    );
    conn.execute(
        &sql,
        params![
            task.id,
            task.user_id,
            task.device_id,
            task.title,
            task.description,
            tags_json,
            task.priority,
            task.due_at.map(format_ts),
            task.state.as_str(),
            task.snoozed_until.map(format_ts),
            task.completed_at.map(format_ts),
            task.event_version,
            format_ts(task.created_at),
            format_ts(task.updated_at),
        ],
    )?;
    Ok(())
}

fn write_tombstone(conn: &Connection, id: &str, deleted_at: DateTime<Utc>) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tombstones (task_id, deleted_at) VALUES (?1, ?2)
         ON CONFLICT(task_id) DO UPDATE SET deleted_at = MAX(deleted_at, excluded.deleted_at)",
        params![id, format_ts(deleted_at)],
    )?;
    Ok(())
}

fn clear_tombstone(conn: &Connection, id: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM tombstones WHERE task_id = ?1", params![id])?;
    Ok(())
}

/// SQLite task store.
///
/// Holds the `tasks` table and the `tombstones` table. Not `Sync`; the
/// orchestrator keeps it behind a mutex and calls it from blocking threads.
pub struct TaskStore {
    conn: Connection,
    device_id: String,
    clock: Arc<dyn Clock>,
}

impl TaskStore {
    /// Open the store at `path`, creating tables if they don't exist.
    pub fn open(
        path: &Path,
        identity: &NodeIdentity,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::with_connection(conn, identity, clock)
    }

    /// Open an in-memory store (tests, simulations).
    pub fn open_memory(identity: &NodeIdentity, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, identity, clock)
    }

    fn with_connection(
        conn: Connection,
        identity: &NodeIdentity,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            conn,
            device_id: identity.device_id().to_string(),
            clock,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id             TEXT PRIMARY KEY,
                user_id        TEXT,
                device_id      TEXT NOT NULL,
                title          TEXT NOT NULL,
                description    TEXT,
                tags           TEXT NOT NULL DEFAULT '[]',
                priority       INTEGER,
                due_at         TEXT,
                state          TEXT NOT NULL DEFAULT 'READY',
                snoozed_until  TEXT,
                completed_at   TEXT,
                event_version  INTEGER NOT NULL DEFAULT 1,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tombstones (
                task_id     TEXT PRIMARY KEY,
                deleted_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_user_id ON tasks(user_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_device_id ON tasks(device_id);
            CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones(deleted_at);",
        )
    }

    /// Identity stamped on locally created tasks and events.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Clock-derived write time that never falls behind `floor`.
    ///
    /// A local write must sort after whatever it replaces and after any
    /// tombstone for the same id, even when the wall clock is behind.
    fn stamp_after(&self, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = self.clock.now();
        match floor {
            Some(floor) if floor >= now => floor + Duration::microseconds(1),
            _ => now,
        }
    }

    fn upserted(&self, task: &Task) -> Result<SyncEvent, StoreError> {
        SyncEvent::task_upserted(task.clone(), self.device_id.clone())
            .map_err(|e| StoreError::InvalidTask(e.to_string()))
    }

    // === Local mutations ===

    /// Add a new task.
    ///
    /// Stamps `device_id`, `event_version = 1` and both timestamps, clears any
    /// stale tombstone for the id, and returns the stored task with its
    /// `TaskUpserted` event.
    pub fn add_task(&self, mut task: Task) -> Result<(Task, SyncEvent), StoreError> {
        if task.id.trim().is_empty() {
            return Err(StoreError::InvalidTask("task id must not be empty".into()));
        }

        let tx = self.conn.unchecked_transaction()?;
        if load_version(&tx, &task.id)?.is_some() {
            return Err(StoreError::InvalidTask(format!(
                "task {} already exists",
                task.id
            )));
        }

        let tombstone = load_tombstone(&tx, &task.id)?;
        let now = self.stamp_after(tombstone);
        task.device_id = self.device_id.clone();
        task.event_version = 1;
        task.created_at = now;
        task.updated_at = now;

        write_task(&tx, &task)?;
        clear_tombstone(&tx, &task.id)?;
        tx.commit()?;

        tracing::debug!(task_id = %task.id, "added task");
        let event = self.upserted(&task)?;
        Ok((task, event))
    }

    /// Replace an existing task with a new local revision.
    ///
    /// `event_version` is bumped; `created_at` and the originating
    /// `device_id` are preserved from the stored row.
    pub fn update_task(&self, mut task: Task) -> Result<(Task, SyncEvent), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let existing =
            load_task(&tx, &task.id)?.ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        let tombstone = load_tombstone(&tx, &task.id)?;

        let floor = match tombstone {
            Some(deleted_at) => existing.updated_at.max(deleted_at),
            None => existing.updated_at,
        };
        task.updated_at = self.stamp_after(Some(floor));
        task.event_version = existing.event_version + 1;
        task.created_at = existing.created_at;
        task.device_id = existing.device_id;

        write_task(&tx, &task)?;
        clear_tombstone(&tx, &task.id)?;
        tx.commit()?;

        tracing::debug!(task_id = %task.id, version = task.event_version, "updated task");
        let event = self.upserted(&task)?;
        Ok((task, event))
    }

    fn transition(
        &self,
        id: &str,
        to: TaskState,
        edit: impl FnOnce(&mut Task),
    ) -> Result<(Task, SyncEvent), StoreError> {
        let mut task = self
            .get_task(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let from = task.state;
        task.transition_to(to, self.clock.now())
            .map_err(|_| StoreError::InvalidTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })?;
        edit(&mut task);
        self.update_task(task)
    }

    /// Mark a task as done.
    pub fn mark_done(&self, id: &str) -> Result<(Task, SyncEvent), StoreError> {
        self.transition(id, TaskState::Done, |_| {})
    }

    /// Snooze a task until `until`.
    pub fn snooze(&self, id: &str, until: DateTime<Utc>) -> Result<(Task, SyncEvent), StoreError> {
        self.transition(id, TaskState::Snoozed, |task| task.snoozed_until = Some(until))
    }

    /// Return a snoozed task to `Ready`.
    pub fn resume(&self, id: &str) -> Result<(Task, SyncEvent), StoreError> {
        self.transition(id, TaskState::Ready, |_| {})
    }

    /// Delete a task, recording a tombstone.
    ///
    /// The tombstone is stamped no earlier than the row it removes so peers
    /// holding that revision accept the deletion. Deleting an unknown id still
    /// records a tombstone.
    pub fn delete_task(&self, id: &str) -> Result<SyncEvent, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = self.clock.now();
        let deleted_at = match load_version(&tx, id)? {
            Some((_, row_updated)) => now.max(row_updated),
            None => now,
        };

        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        write_tombstone(&tx, id, deleted_at)?;
        tx.commit()?;

        tracing::debug!(task_id = %id, "deleted task");
        SyncEvent::task_deleted(id, self.device_id.clone(), deleted_at)
            .map_err(|e| StoreError::InvalidTask(e.to_string()))
    }

    // === Queries ===

    /// Get a task by ID.
    pub fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        load_task(&self.conn, id)
    }

    /// List tasks, optionally filtered by owner and originating device.
    pub fn get_tasks(
        &self,
        user_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR device_id = ?2)
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![user_id, device_id], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Tombstone time for `id`, if the task has been deleted.
    pub fn tombstone(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        load_tombstone(&self.conn, id)
    }

    /// Number of tombstones currently retained.
    pub fn tombstone_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tombstones", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop tombstones older than `cutoff`. Returns how many were removed.
    ///
    /// Operator-invoked only: a peer that stays offline past `cutoff` can
    /// resurrect a task deleted before it.
    pub fn purge_tombstones_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM tombstones WHERE deleted_at < ?1",
            params![format_ts(cutoff)],
        )?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "purged tombstones");
        }
        Ok(removed)
    }

    /// Inventory summary, optionally restricted to one owner.
    pub fn manifest(&self, user_id: Option<&str>) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_version, updated_at, device_id, user_id FROM tasks
             WHERE (?1 IS NULL OR user_id = ?1)
             ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![user_id], |row| {
                let updated_at: String = row.get(2)?;
                Ok(ManifestEntry {
                    task_id: row.get(0)?,
                    event_version: row.get(1)?,
                    updated_at: parse_ts(2, &updated_at)?,
                    device_id: row.get(3)?,
                    user_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Classify a peer's manifest against the local inventory.
    pub fn compare_manifest(
        &self,
        remote: &[ManifestEntry],
        user_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<ManifestDiff, StoreError> {
        let local = self.manifest(user_id)?;
        Ok(compare_manifest(&local, remote, user_id, device_id))
    }

    // === Remote applies ===

    /// Apply a task received from a peer.
    ///
    /// Returns `false` for stale or duplicate input: a tombstone at or after
    /// `updated_at`, or a stored revision whose `(event_version, updated_at)`
    /// is not older than the incoming one. On `true` the stored row equals
    /// `task` with `updated_at` set to the given value.
    pub fn apply_remote_upsert(
        &self,
        mut task: Task,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if task.id.trim().is_empty() {
            return Err(StoreError::InvalidTask("task id must not be empty".into()));
        }
        task.updated_at = updated_at;

        let tx = self.conn.unchecked_transaction()?;
        if let Some(deleted_at) = load_tombstone(&tx, &task.id)? {
            if deleted_at >= updated_at {
                tracing::debug!(task_id = %task.id, "remote upsert blocked by tombstone");
                return Ok(false);
            }
        }

        if let Some(existing) = load_version(&tx, &task.id)? {
            if compare_versions(existing, task.version_key()) != Ordering::Less {
                tracing::debug!(task_id = %task.id, "remote upsert is stale");
                return Ok(false);
            }
        }

        write_task(&tx, &task)?;
        clear_tombstone(&tx, &task.id)?;
        tx.commit()?;

        tracing::debug!(task_id = %task.id, version = task.event_version, "applied remote upsert");
        Ok(true)
    }

    /// Apply a deletion received from a peer.
    ///
    /// A row edited after `deleted_at` survives, but the tombstone still
    /// advances. Returns `true` when a row was removed or the tombstone moved
    /// forward, `false` when an equal-or-newer tombstone already exists.
    pub fn apply_remote_delete(
        &self,
        id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        if let Some(existing) = load_tombstone(&tx, id)? {
            if existing >= deleted_at {
                return Ok(false);
            }
        }

        let protected = match load_version(&tx, id)? {
            Some((_, row_updated)) => row_updated > deleted_at,
            None => false,
        };
        let removed = if protected {
            0
        } else {
            tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?
        };

        write_tombstone(&tx, id, deleted_at)?;
        tx.commit()?;

        tracing::debug!(task_id = %id, removed, protected, "applied remote delete");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (TaskStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let identity = NodeIdentity::new("node-local").unwrap();
        let store = TaskStore::open_memory(&identity, clock.clone()).unwrap();
        (store, clock)
    }

    fn remote_task(id: &str, version: i64, updated_at: DateTime<Utc>) -> Task {
        let mut task = Task::new(format!("remote {id} v{version}"));
        task.id = id.to_string();
        task.device_id = "node-remote".to_string();
        task.event_version = version;
        task.created_at = t0();
        task.updated_at = updated_at;
        task
    }

    #[test]
    fn add_task_stamps_identity_and_version() {
        let (store, _clock) = setup();
        let (task, event) = store.add_task(Task::new("Write tests")).unwrap();

        assert_eq!(task.device_id, "node-local");
        assert_eq!(task.event_version, 1);
        assert_eq!(task.updated_at, t0());
        assert_eq!(event.device_id(), "node-local");
        assert_eq!(store.get_task(&task.id).unwrap().unwrap(), task);
    }

    #[test]
    fn add_task_rejects_duplicate_id() {
        let (store, _clock) = setup();
        let (task, _) = store.add_task(Task::new("once")).unwrap();
        let mut again = Task::new("twice");
        again.id = task.id;
        assert!(matches!(store.add_task(again), Err(StoreError::InvalidTask(_))));
    }

    #[test]
    fn update_task_bumps_version_and_preserves_origin() {
        let (store, clock) = setup();
        let (mut task, _) = store.add_task(Task::new("Draft")).unwrap();

        clock.advance(Duration::minutes(1));
        task.title = "Final".to_string();
        task.device_id = "someone-else".to_string();
        let (updated, _) = store.update_task(task).unwrap();

        assert_eq!(updated.event_version, 2);
        assert_eq!(updated.updated_at, t0() + Duration::minutes(1));
        assert_eq!(updated.device_id, "node-local");
        assert_eq!(updated.created_at, t0());
    }

    #[test]
    fn update_missing_task_is_not_found() {
        let (store, _clock) = setup();
        assert!(matches!(
            store.update_task(Task::new("ghost")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn local_writes_never_move_backwards_in_time() {
        let (store, clock) = setup();
        let (task, _) = store.add_task(Task::new("Skewed")).unwrap();

        clock.set(t0() - Duration::hours(1));
        let (updated, _) = store.update_task(task.clone()).unwrap();
        assert!(updated.updated_at > task.updated_at);
    }

    #[test]
    fn lifecycle_transitions_publish_new_revisions() {
        let (store, clock) = setup();
        let (task, _) = store.add_task(Task::new("Lifecycle")).unwrap();

        clock.advance(Duration::minutes(1));
        let until = clock.now() + Duration::hours(2);
        let (snoozed, _) = store.snooze(&task.id, until).unwrap();
        assert_eq!(snoozed.state, TaskState::Snoozed);
        assert_eq!(snoozed.snoozed_until, Some(until));

        clock.advance(Duration::minutes(1));
        let (resumed, _) = store.resume(&task.id).unwrap();
        assert_eq!(resumed.state, TaskState::Ready);
        assert!(resumed.snoozed_until.is_none());

        clock.advance(Duration::minutes(1));
        let (done, event) = store.mark_done(&task.id).unwrap();
        assert_eq!(done.state, TaskState::Done);
        assert_eq!(done.event_version, 4);
        assert!(done.completed_at.is_some());
        assert_eq!(event.task_id(), Some(task.id.as_str()));

        assert!(matches!(
            store.mark_done(&task.id),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn delete_task_records_tombstone() {
        let (store, clock) = setup();
        let (task, _) = store.add_task(Task::new("Short-lived")).unwrap();

        clock.advance(Duration::minutes(3));
        let event = store.delete_task(&task.id).unwrap();

        assert!(store.get_task(&task.id).unwrap().is_none());
        assert_eq!(store.tombstone(&task.id).unwrap(), Some(t0() + Duration::minutes(3)));
        match event {
            SyncEvent::TaskDeleted { deleted_at, .. } => {
                assert_eq!(deleted_at, t0() + Duration::minutes(3));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn get_tasks_filters_by_user_and_device() {
        let (store, _clock) = setup();
        store.add_task(Task::new("a").with_user("alice")).unwrap();
        store.add_task(Task::new("b").with_user("bob")).unwrap();
        store
            .apply_remote_upsert(remote_task("r1", 1, t0()).with_user("alice"), t0())
            .unwrap();

        assert_eq!(store.get_tasks(None, None).unwrap().len(), 3);
        assert_eq!(store.get_tasks(Some("alice"), None).unwrap().len(), 2);
        assert_eq!(store.get_tasks(Some("alice"), Some("node-remote")).unwrap().len(), 1);
        assert_eq!(store.get_tasks(None, Some("node-local")).unwrap().len(), 2);
    }

    #[test]
    fn remote_upsert_inserts_then_rejects_duplicate() {
        let (store, _clock) = setup();
        let task = remote_task("t1", 1, t0());

        assert!(store.apply_remote_upsert(task.clone(), t0()).unwrap());
        let after_first = store.get_task("t1").unwrap();
        assert!(!store.apply_remote_upsert(task, t0()).unwrap());
        assert_eq!(store.get_task("t1").unwrap(), after_first);
    }

    #[test]
    fn stale_and_fresh_upserts() {
        let (store, _clock) = setup();
        let t = t0();
        store.apply_remote_upsert(remote_task("t1", 3, t), t).unwrap();

        let stale = t - Duration::minutes(5);
        assert!(!store.apply_remote_upsert(remote_task("t1", 3, stale), stale).unwrap());
        assert_eq!(store.get_task("t1").unwrap().unwrap().updated_at, t);

        let fresh = t + Duration::minutes(5);
        assert!(store.apply_remote_upsert(remote_task("t1", 3, fresh), fresh).unwrap());
        assert_eq!(store.get_task("t1").unwrap().unwrap().updated_at, fresh);
    }

    #[test]
    fn higher_version_wins_over_later_timestamp() {
        let (store, _clock) = setup();
        store.apply_remote_upsert(remote_task("t1", 5, t0()), t0()).unwrap();

        let later = t0() + Duration::hours(1);
        assert!(!store.apply_remote_upsert(remote_task("t1", 2, later), later).unwrap());
        assert_eq!(store.get_task("t1").unwrap().unwrap().event_version, 5);
    }

    #[test]
    fn tombstone_blocks_older_upsert_and_yields_to_newer() {
        let (store, _clock) = setup();
        let deleted_at = t0() + Duration::minutes(10);
        assert!(store.apply_remote_delete("t1", deleted_at).unwrap());

        assert!(!store.apply_remote_upsert(remote_task("t1", 9, deleted_at), deleted_at).unwrap());
        let earlier = t0();
        assert!(!store.apply_remote_upsert(remote_task("t1", 9, earlier), earlier).unwrap());
        assert!(store.get_task("t1").unwrap().is_none());

        let newer = deleted_at + Duration::seconds(1);
        assert!(store.apply_remote_upsert(remote_task("t1", 1, newer), newer).unwrap());
        assert!(store.tombstone("t1").unwrap().is_none());
        assert!(store.get_task("t1").unwrap().is_some());
    }

    #[test]
    fn remote_delete_removes_older_row() {
        let (store, _clock) = setup();
        store.apply_remote_upsert(remote_task("t1", 1, t0()), t0()).unwrap();

        let deleted_at = t0() + Duration::minutes(1);
        assert!(store.apply_remote_delete("t1", deleted_at).unwrap());
        assert!(store.get_task("t1").unwrap().is_none());
        assert_eq!(store.tombstone("t1").unwrap(), Some(deleted_at));
    }

    #[test]
    fn newer_edit_survives_stale_delete() {
        let (store, _clock) = setup();
        let edited = t0() + Duration::minutes(10);
        store.apply_remote_upsert(remote_task("t1", 2, edited), edited).unwrap();

        let deleted_at = t0() + Duration::minutes(5);
        assert!(store.apply_remote_delete("t1", deleted_at).unwrap());
        assert!(store.get_task("t1").unwrap().is_some());
        assert_eq!(store.tombstone("t1").unwrap(), Some(deleted_at));
    }

    #[test]
    fn repeated_or_older_delete_is_rejected() {
        let (store, _clock) = setup();
        let deleted_at = t0() + Duration::minutes(5);
        assert!(store.apply_remote_delete("t1", deleted_at).unwrap());
        assert!(!store.apply_remote_delete("t1", deleted_at).unwrap());
        assert!(!store.apply_remote_delete("t1", t0()).unwrap());

        let later = deleted_at + Duration::minutes(1);
        assert!(store.apply_remote_delete("t1", later).unwrap());
        assert_eq!(store.tombstone("t1").unwrap(), Some(later));
    }

    #[test]
    fn re_adding_after_delete_sorts_after_tombstone() {
        let (store, clock) = setup();
        let future_delete = t0() + Duration::hours(1);
        store.apply_remote_delete("t1", future_delete).unwrap();

        let mut task = Task::new("back again");
        task.id = "t1".to_string();
        let (added, _) = store.add_task(task).unwrap();
        assert!(added.updated_at > future_delete);
        assert!(store.tombstone("t1").unwrap().is_none());
        assert!(clock.now() < added.updated_at);
    }

    #[test]
    fn manifest_projects_version_and_owner() {
        let (store, _clock) = setup();
        let (task, _) = store.add_task(Task::new("m").with_user("alice")).unwrap();
        store.add_task(Task::new("n").with_user("bob")).unwrap();

        let manifest = store.manifest(Some("alice")).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].task_id, task.id);
        assert_eq!(manifest[0].event_version, 1);
        assert_eq!(manifest[0].device_id.as_deref(), Some("node-local"));
        assert_eq!(store.manifest(None).unwrap().len(), 2);
    }

    #[test]
    fn purge_tombstones_respects_cutoff() {
        let (store, _clock) = setup();
        store.apply_remote_delete("old", t0()).unwrap();
        store.apply_remote_delete("new", t0() + Duration::days(30)).unwrap();

        let removed = store.purge_tombstones_before(t0() + Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.tombstone_count().unwrap(), 1);
        assert!(store.tombstone("new").unwrap().is_some());
    }

    #[test]
    fn timestamps_survive_storage_with_full_precision() {
        let (store, _clock) = setup();
        let precise = t0() + Duration::nanoseconds(123_456_789);
        store.apply_remote_upsert(remote_task("p", 1, precise), precise).unwrap();
        assert_eq!(store.get_task("p").unwrap().unwrap().updated_at, precise);
    }

    #[test]
    fn corrupt_tags_column_is_an_error() {
        let (store, _clock) = setup();
        store.apply_remote_upsert(remote_task("c", 1, t0()), t0()).unwrap();
        store
            .conn
            .execute("UPDATE tasks SET tags = 'not json' WHERE id = 'c'", [])
            .unwrap();

        assert!(store.get_task("c").is_err());
        assert!(store.get_tasks(None, None).is_err());
    }
}
