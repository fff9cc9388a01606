//! Wire events exchanged between peers.
//!
//! Every message is one variant of the closed [`SyncEvent`] union, tagged by a
//! `"type"` discriminant and encoded as camelCase JSON. Outbox replay decodes
//! through the same union, so there is no runtime type-name lookup anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::manifest::ManifestEntry;
use crate::sync::types::SyncError;
use crate::task::Task;

/// Discriminant of a [`SyncEvent`], as written to the `"type"` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    TaskUpserted,
    TaskDeleted,
    ManifestAnnounce,
    TasksRequested,
}

impl SyncEventKind {
    /// Wire name of the kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncEventKind::TaskUpserted => "taskUpserted",
            SyncEventKind::TaskDeleted => "taskDeleted",
            SyncEventKind::ManifestAnnounce => "manifestAnnounce",
            SyncEventKind::TasksRequested => "tasksRequested",
        }
    }
}

/// A message between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// A task was created or replaced.
    TaskUpserted {
        task: Task,
        device_id: String,
        updated_at: DateTime<Utc>,
    },
    /// A task was deleted.
    TaskDeleted {
        task_id: String,
        device_id: String,
        deleted_at: DateTime<Utc>,
    },
    /// Inventory summary sent when a connection comes up.
    ManifestAnnounce {
        device_id: String,
        #[serde(default)]
        user_id: Option<String>,
        entries: Vec<ManifestEntry>,
    },
    /// Ask the receiving peer to send whole records for these ids.
    TasksRequested {
        device_id: String,
        task_ids: Vec<String>,
    },
}

impl SyncEvent {
    /// Build a `TaskUpserted` carrying the task's own `updated_at`.
    ///
    /// Fails fast on a missing task id or publisher identity.
    pub fn task_upserted(task: Task, device_id: impl Into<String>) -> Result<Self, SyncError> {
        let device_id = device_id.into();
        require("task.id", &task.id)?;
        require("deviceId", &device_id)?;
        let updated_at = task.updated_at;
        Ok(SyncEvent::TaskUpserted {
            task,
            device_id,
            updated_at,
        })
    }

    /// Build a `TaskDeleted`.
    pub fn task_deleted(
        task_id: impl Into<String>,
        device_id: impl Into<String>,
        deleted_at: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let task_id = task_id.into();
        let device_id = device_id.into();
        require("taskId", &task_id)?;
        require("deviceId", &device_id)?;
        Ok(SyncEvent::TaskDeleted {
            task_id,
            device_id,
            deleted_at,
        })
    }

    /// Discriminant of this event.
    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::TaskUpserted { .. } => SyncEventKind::TaskUpserted,
            SyncEvent::TaskDeleted { .. } => SyncEventKind::TaskDeleted,
            SyncEvent::ManifestAnnounce { .. } => SyncEventKind::ManifestAnnounce,
            SyncEvent::TasksRequested { .. } => SyncEventKind::TasksRequested,
        }
    }

    /// Wire name of the discriminant.
    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    /// Device that published this event.
    pub fn device_id(&self) -> &str {
        match self {
            SyncEvent::TaskUpserted { device_id, .. }
            | SyncEvent::TaskDeleted { device_id, .. }
            | SyncEvent::ManifestAnnounce { device_id, .. }
            | SyncEvent::TasksRequested { device_id, .. } => device_id,
        }
    }

    /// Task the event is about, for task-level events.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SyncEvent::TaskUpserted { task, .. } => Some(&task.id),
            SyncEvent::TaskDeleted { task_id, .. } => Some(task_id),
            SyncEvent::ManifestAnnounce { .. } | SyncEvent::TasksRequested { .. } => None,
        }
    }

    /// Identity used by the inbound deduplication window.
    ///
    /// Manifest exchange messages are never deduplicated.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            SyncEvent::TaskUpserted {
                task,
                device_id,
                updated_at,
            } => Some(format!(
                "upsert:{}:{}:{}:{}",
                task.id,
                task.event_version,
                updated_at.to_rfc3339(),
                device_id
            )),
            SyncEvent::TaskDeleted {
                task_id,
                device_id,
                deleted_at,
            } => Some(format!(
                "delete:{}:{}:{}",
                task_id,
                deleted_at.to_rfc3339(),
                device_id
            )),
            SyncEvent::ManifestAnnounce { .. } | SyncEvent::TasksRequested { .. } => None,
        }
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn require(field: &str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::InvalidEvent(format!("{field} must not be empty")));
    }
    Ok(())
}
