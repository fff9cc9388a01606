// Node identity for peer-to-peer sync
// Format: "node-<uuid>"

use std::fs;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::sync::types::SyncError;

const DEVICE_ID_FILE: &str = "device_id.txt";
const DEVICE_ID_PREFIX: &str = "node-";

/// Error type for device ID operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceIdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid device ID format: {0}")]
    InvalidFormat(String),
}

/// Identity of this node, owned by the orchestrator.
///
/// Tags every locally-originated event and is compared against inbound
/// events to drop echoes of our own publications.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    device_id: String,
}

impl NodeIdentity {
    /// Wrap an existing device id. Empty ids are rejected.
    pub fn new(device_id: impl Into<String>) -> Result<Self, SyncError> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(SyncError::InvalidEvent(
                "device id must not be empty".to_string(),
            ));
        }
        Ok(Self { device_id })
    }

    /// Load the persisted identity from `dir`, generating it on first use.
    pub fn load_or_create(dir: &Path) -> Result<Self, DeviceIdError> {
        let device_id = get_or_create_device_id_at(dir)?;
        Ok(Self { device_id })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// True if `device_id` is this node.
    pub fn is_self(&self, device_id: &str) -> bool {
        self.device_id == device_id
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.device_id)
    }
}

/// Get or create device ID at the specified path.
/// Creates a new device ID file if it doesn't exist.
///
/// # Arguments
/// * `path` - Directory path where device_id.txt is stored
///
/// # Returns
/// Device ID string in format "node-<uuid>"
pub fn get_or_create_device_id_at(path: &Path) -> Result<String, DeviceIdError> {
    let device_id_path = path.join(DEVICE_ID_FILE);

    if device_id_path.exists() {
        let content = fs::read_to_string(&device_id_path)?;
        let device_id = content.trim().to_string();

        if device_id.starts_with(DEVICE_ID_PREFIX) && device_id.len() > DEVICE_ID_PREFIX.len() {
            return Ok(device_id);
        }
        return Err(DeviceIdError::InvalidFormat(device_id));
    }

    let device_id = format!("{}{}", DEVICE_ID_PREFIX, Uuid::new_v4());

    if !path.exists() {
        fs::create_dir_all(path)?;
    }

    let mut file = fs::File::create(&device_id_path)?;
    writeln!(file, "{}", device_id)?;
    tracing::info!(device_id = %device_id, "generated new device id");

    Ok(device_id)
}
