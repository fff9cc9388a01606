mod config;
pub mod task_store;

pub use config::{Config, PeerAddr, SyncConfig};
pub use task_store::TaskStore;

use std::path::PathBuf;

/// Returns the data directory, creating it if needed.
///
/// `TASKSYNC_DATA_DIR` overrides the location outright. Otherwise this is
/// `~/.config/tasksync[-dev]/`, with TASKSYNC_ENV=dev selecting the
/// development directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    if let Ok(dir) = std::env::var("TASKSYNC_DATA_DIR") {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;
        return Ok(dir);
    }

    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("TASKSYNC_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("tasksync-dev")
    } else {
        base_dir.join("tasksync")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
