//! Durable FIFO of events that could not be delivered.
//!
//! The whole queue is one JSON array rewritten on every mutation. Entries keep
//! the encoded event next to its discriminant so replay can check the payload
//! against what was queued before decoding it through [`SyncEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::sync::event::SyncEvent;
use crate::sync::types::SyncError;

/// One queued event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEvent {
    /// Wire discriminant of the payload (`taskUpserted`, ...).
    pub type_name: String,
    /// JSON encoding of the event.
    pub payload: String,
    pub queued_at: DateTime<Utc>,
}

impl PendingEvent {
    pub fn from_event(event: &SyncEvent, queued_at: DateTime<Utc>) -> Result<Self, SyncError> {
        Ok(Self {
            type_name: event.type_name().to_string(),
            payload: event.to_json()?,
            queued_at,
        })
    }

    /// Decode the payload, verifying it matches the queued discriminant.
    pub fn decode(&self) -> Result<SyncEvent, SyncError> {
        let event = SyncEvent::from_json(&self.payload)?;
        if event.type_name() != self.type_name {
            return Err(SyncError::TypeMismatch {
                queued: self.type_name.clone(),
                actual: event.type_name().to_string(),
            });
        }
        Ok(event)
    }
}

/// Pending outbox backed by a single JSON file.
#[derive(Debug)]
pub struct Outbox {
    pending: Vec<PendingEvent>,
    path: PathBuf,
}

impl Outbox {
    /// Empty outbox that will persist to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            pending: Vec::new(),
            path,
        }
    }

    /// Load the outbox at `path`. A missing file is an empty outbox.
    pub fn load(path: PathBuf) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::new(path));
        }

        let content = std::fs::read_to_string(&path)?;
        let pending: Vec<PendingEvent> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content)?
        };
        tracing::debug!(path = %path.display(), pending = pending.len(), "loaded outbox");
        Ok(Self { pending, path })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append an entry and persist.
    pub fn push(&mut self, entry: PendingEvent) -> Result<(), SyncError> {
        self.pending.push(entry);
        self.persist()
    }

    /// Copy of the queued entries, oldest first.
    pub fn snapshot(&self) -> Vec<PendingEvent> {
        self.pending.clone()
    }

    /// Drop one queued occurrence of each delivered entry and persist.
    ///
    /// Entries queued after the snapshot that produced `delivered` are kept.
    /// Returns how many entries were removed.
    pub fn remove_delivered(&mut self, delivered: &[PendingEvent]) -> Result<usize, SyncError> {
        let mut removed = 0;
        for entry in delivered {
            if let Some(pos) = self.pending.iter().position(|p| p == entry) {
                self.pending.remove(pos);
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Rewrite the backing file with the current queue.
    pub fn persist(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(&self.pending)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
