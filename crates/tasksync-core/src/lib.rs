//! # tasksync core library
//!
//! Local task store plus a peer-to-peer sync engine that keeps independent
//! stores on several devices consistent without a central server.
//!
//! ## Architecture
//!
//! - **Task model**: [`Task`] records replaced wholesale between peers
//! - **Storage**: SQLite task table with deletion tombstones, TOML configuration
//! - **Sync**: event model, manifest reconciler, TCP transport, durable outbox
//!   and the [`SyncOrchestrator`] tying them together
//!
//! ## Key Components
//!
//! - [`TaskStore`]: local persistence and idempotent remote applies
//! - [`SyncOrchestrator`]: publish/receive paths, reconnect loop, loop prevention
//! - [`compare_manifest`]: anti-entropy classification of two inventories
//! - [`Config`]: node configuration

pub mod clock;
pub mod error;
pub mod storage;
pub mod sync;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, CoreError, StoreError};
pub use storage::{data_dir, Config, PeerAddr, SyncConfig, TaskStore};
pub use sync::{
    compare_manifest, ChangeOrigin, ConnectionState, ManifestDiff, ManifestEntry, NodeIdentity,
    SyncError, SyncEvent, SyncOrchestrator, SyncStatus,
};
pub use task::{Task, TaskState};
