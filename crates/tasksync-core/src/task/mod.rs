//! Replicated task record and its lifecycle.
//!
//! A [`Task`] travels between peers as a whole: remote applies replace the
//! stored row wholesale, so every field here is part of the wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle state.
///
///   READY ────> DONE
///    ^  |        ^
///    |  v        |
///   SNOOZED ─────+
///
/// - READY → SNOOZED / DONE
/// - SNOOZED → READY / DONE
/// - DONE is terminal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Task is open (initial state)
    #[default]
    Ready,
    /// Task is hidden until `snoozed_until`
    Snoozed,
    /// Task is completed (terminal state)
    Done,
}

impl TaskState {
    /// Check if a transition is valid.
    pub fn can_transition_to(&self, to: &TaskState) -> bool {
        match self {
            TaskState::Ready => matches!(to, TaskState::Snoozed | TaskState::Done),
            TaskState::Snoozed => matches!(to, TaskState::Ready | TaskState::Done),
            TaskState::Done => false,
        }
    }

    /// Storage / display form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Snoozed => "SNOOZED",
            TaskState::Done => "DONE",
        }
    }

    /// Parse the storage form. Unknown values fall back to `Ready`.
    pub fn parse(value: &str) -> TaskState {
        match value {
            "SNOOZED" => TaskState::Snoozed,
            "DONE" => TaskState::Done,
            _ => TaskState::Ready,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replicated task aggregate.
///
/// `updated_at` and `event_version` are owned by the store: local mutations
/// restamp them, remote applies take them from the incoming event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier shared by every replica
    pub id: String,
    /// Owner of the task
    #[serde(default)]
    pub user_id: Option<String>,
    /// Device that created the task
    pub device_id: String,
    /// Task title
    pub title: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Priority value (0-100, null for default)
    #[serde(default)]
    pub priority: Option<i32>,
    /// Optional due date
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Lifecycle state
    pub state: TaskState,
    /// Wake-up time while snoozed
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    /// Completion timestamp
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic per-record mutation counter
    pub event_version: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last accepted write; authoritative for conflict resolution
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with default values.
    ///
    /// `device_id`, `event_version` and the timestamps are restamped by the
    /// store when the task is added.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Task {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            user_id: None,
            device_id: String::new(),
            title: title.into(),
            description: None,
            tags: Vec::new(),
            priority: None,
            due_at: None,
            state: TaskState::Ready,
            snoozed_until: None,
            completed_at: None,
            event_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style owner assignment.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Lexicographic `(event_version, updated_at)` key used for last-write-wins.
    pub fn version_key(&self) -> (i64, DateTime<Utc>) {
        (self.event_version, self.updated_at)
    }

    /// Transition to a new state at `at`.
    ///
    /// Returns an error if the transition is invalid.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        at: DateTime<Utc>,
    ) -> Result<(), TaskTransitionError> {
        if !self.state.can_transition_to(&new_state) {
            return Err(TaskTransitionError {
                from: self.state,
                to: new_state,
            });
        }

        match new_state {
            TaskState::Done => {
                self.completed_at = Some(at);
                self.snoozed_until = None;
            }
            TaskState::Ready => {
                self.snoozed_until = None;
            }
            TaskState::Snoozed => {}
        }

        self.state = new_state;
        Ok(())
    }
}

impl Default for Task {
    fn default() -> Self {
        Task::new("")
    }
}

/// Error returned when an invalid state transition is attempted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

impl fmt::Display for TaskTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for TaskTransitionError {}
