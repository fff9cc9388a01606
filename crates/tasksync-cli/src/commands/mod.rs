pub mod config;
pub mod sync;
pub mod task;
pub mod tombstones;

use tasksync_core::{data_dir, Config, SyncOrchestrator};

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Runtime for a single command invocation.
pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Open this device's node from the data directory without starting it.
///
/// Local changes made through it are queued in the outbox until the next
/// `sync run` connects to a peer.
pub fn open_node() -> CliResult<SyncOrchestrator> {
    let dir = data_dir()?;
    let config = Config::load()?;
    Ok(SyncOrchestrator::open(&dir, config.sync)?)
}
