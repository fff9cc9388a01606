//! Tombstone retention.
//!
//! Tombstones are never collected automatically. Purging one lets a peer that
//! was offline since before the deletion bring the task back.

use chrono::Duration;
use clap::Subcommand;
use std::sync::Arc;
use tasksync_core::{data_dir, Clock, NodeIdentity, SystemClock, TaskStore};

use super::CliResult;

#[derive(Subcommand)]
pub enum TombstonesAction {
    /// Delete tombstones older than the given age
    Purge {
        /// Minimum age in days
        #[arg(long, default_value = "90")]
        older_than_days: i64,
    },
    /// Show how many tombstones are retained
    Count,
}

pub fn run(action: TombstonesAction) -> CliResult {
    let dir = data_dir()?;
    let identity = NodeIdentity::load_or_create(&dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = TaskStore::open(&dir.join("tasksync.db"), &identity, clock.clone())?;

    match action {
        TombstonesAction::Purge { older_than_days } => {
            if older_than_days < 0 {
                return Err("--older-than-days must not be negative".into());
            }
            let cutoff = Duration::try_days(older_than_days)
                .and_then(|d| clock.now().checked_sub_signed(d))
                .ok_or("--older-than-days is out of range")?;
            let removed = store.purge_tombstones_before(cutoff)?;
            println!("Purged {removed} tombstone(s) older than {}", cutoff.to_rfc3339());
        }
        TombstonesAction::Count => {
            println!("{}", store.tombstone_count()?);
        }
    }
    Ok(())
}
