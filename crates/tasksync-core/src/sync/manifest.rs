//! Anti-entropy manifest comparison.
//!
//! Peers exchange compact `(id, version, timestamp, owner)` summaries and each
//! side decides which whole records to fetch and which to push. Records are
//! replaced wholesale, so no field-level merge happens here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Per-task summary used for reconciliation. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub task_id: String,
    pub event_version: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Canonical last-write-wins order: higher `event_version` wins outright,
/// equal versions fall back to the later `updated_at`.
///
/// The store's remote-apply path and the reconciler both use this order.
pub fn compare_versions(
    left: (i64, DateTime<Utc>),
    right: (i64, DateTime<Utc>),
) -> Ordering {
    left.0.cmp(&right.0).then(left.1.cmp(&right.1))
}

/// Classification of every id present in either inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDiff {
    /// Present remotely, absent locally.
    pub missing: Vec<String>,
    /// Present on both sides, remote copy is newer.
    pub remote_newer: Vec<String>,
    /// Local copy is newer, or the remote does not have it at all.
    pub local_newer: Vec<String>,
    /// Same `(event_version, updated_at)` on both sides.
    pub equal: Vec<String>,
}

impl ManifestDiff {
    /// Ids to fetch from the remote: `missing ∪ remote_newer`.
    pub fn tasks_to_request(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .missing
            .iter()
            .chain(self.remote_newer.iter())
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Ids to push to the remote.
    pub fn tasks_to_advertise(&self) -> Vec<String> {
        self.local_newer.clone()
    }

    /// True when neither side needs anything from the other.
    pub fn is_in_sync(&self) -> bool {
        self.missing.is_empty() && self.remote_newer.is_empty() && self.local_newer.is_empty()
    }

    /// Total number of classified ids.
    pub fn len(&self) -> usize {
        self.missing.len() + self.remote_newer.len() + self.local_newer.len() + self.equal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify a remote manifest against the local inventory.
///
/// When `user_id` is given, only local entries owned by that user take part.
/// Every remote entry is classified whatever its owner, so each id from either
/// side lands in exactly one bucket. `device_id` names the peer for
/// diagnostics only.
pub fn compare_manifest(
    local: &[ManifestEntry],
    remote: &[ManifestEntry],
    user_id: Option<&str>,
    device_id: Option<&str>,
) -> ManifestDiff {
    let in_scope_local = |entry: &&ManifestEntry| match user_id {
        Some(user) => entry.user_id.as_deref() == Some(user),
        None => true,
    };

    let local_map: BTreeMap<&str, (i64, DateTime<Utc>)> = local
        .iter()
        .filter(in_scope_local)
        .map(|e| (e.task_id.as_str(), (e.event_version, e.updated_at)))
        .collect();

    // A peer listing an id twice is collapsed to its newest entry.
    let mut remote_map: BTreeMap<&str, (i64, DateTime<Utc>)> = BTreeMap::new();
    for entry in remote {
        let key = (entry.event_version, entry.updated_at);
        remote_map
            .entry(entry.task_id.as_str())
            .and_modify(|existing| {
                if compare_versions(key, *existing) == Ordering::Greater {
                    *existing = key;
                }
            })
            .or_insert(key);
    }

    let mut diff = ManifestDiff::default();
    let mut seen: BTreeSet<&str> = BTreeSet::new();

    for (id, remote_key) in &remote_map {
        seen.insert(*id);
        match local_map.get(id) {
            None => diff.missing.push((*id).to_string()),
            Some(local_key) => match compare_versions(*remote_key, *local_key) {
                Ordering::Greater => diff.remote_newer.push((*id).to_string()),
                Ordering::Equal => diff.equal.push((*id).to_string()),
                Ordering::Less => diff.local_newer.push((*id).to_string()),
            },
        }
    }

    for id in local_map.keys() {
        if !seen.contains(id) {
            diff.local_newer.push((*id).to_string());
        }
    }
    diff.local_newer.sort();

    tracing::debug!(
        peer = device_id.unwrap_or("-"),
        missing = diff.missing.len(),
        remote_newer = diff.remote_newer.len(),
        local_newer = diff.local_newer.len(),
        equal = diff.equal.len(),
        "compared manifest"
    );

    diff
}
