//! Time-bounded set of recently seen inbound events.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Remembers event keys for `window` after they were recorded.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True if `key` was recorded less than one window before `now`.
    pub fn is_duplicate(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.prune(now);
        self.seen.contains_key(key)
    }

    /// Remember `key` as handled at `now`.
    pub fn record(&mut self, key: String, now: DateTime<Utc>) {
        self.seen.insert(key, now);
    }

    /// Forget keys older than the window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.seen.retain(|_, seen_at| now - *seen_at < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
