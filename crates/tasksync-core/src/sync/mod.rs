//! Peer-to-peer synchronization layer.
//!
//! Keeps the local task store consistent with every reachable peer:
//! last-write-wins on `(event_version, updated_at)`, deletion tombstones,
//! manifest-based anti-entropy on connect, and a durable outbox for events
//! that could not be delivered.

pub mod dedup;
pub mod device_id;
pub mod event;
pub mod manifest;
pub mod orchestrator;
pub mod outbox;
pub mod transport;
pub mod types;


pub use device_id::{get_or_create_device_id_at, DeviceIdError, NodeIdentity};
pub use event::{SyncEvent, SyncEventKind};
pub use manifest::{compare_manifest, compare_versions, ManifestDiff, ManifestEntry};
pub use orchestrator::{AppliedChange, ChangeOrigin, SyncOrchestrator};
pub use outbox::{Outbox, PendingEvent};
pub use transport::{TcpTransport, Transport};
pub use types::{ConnectionState, SyncError, SyncStatus};
