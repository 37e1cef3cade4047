//! Checkpoint persistence for replication position and snapshot progress.
//!
//! The checkpoint records the last confirmed Log Sequence Number (LSN) and
//! whether a snapshot phase is currently in effect. At startup the snapshot
//! policy consumes this state to decide between snapshotting and resuming
//! the stream from the persisted position.
//!
//! # Example
//!
//! ```rust,no_run
//! use wal2json_capture::checkpoint::{Checkpoint, CheckpointManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming from LSN: {}", checkpoint.lsn);
//!     }
//!
//!     let checkpoint = Checkpoint::new("16/B374D848".to_string(), 100);
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::postgres::OffsetState;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// A point in the replication stream that has been fully published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The last confirmed LSN, in PostgreSQL `X/X` notation
    pub lsn: String,
    /// True while a snapshot phase has started but not completed
    #[serde(default)]
    pub snapshot_in_effect: bool,
    /// When this checkpoint was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of messages processed since startup
    pub message_count: u64,
}

impl Checkpoint {
    pub fn new(lsn: String, message_count: u64) -> Self {
        Self {
            lsn,
            snapshot_in_effect: false,
            timestamp: chrono::Utc::now(),
            message_count,
        }
    }

    /// The slice of this checkpoint the snapshot policy looks at.
    pub fn offset_state(&self) -> OffsetState {
        OffsetState {
            snapshot_in_effect: self.snapshot_in_effect,
        }
    }
}

/// Manages checkpoint persistence to disk.
///
/// Writes go to a temporary file that is synced and atomically renamed, so
/// the checkpoint file is never partially written even across a crash.
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    /// Loads the checkpoint if one exists.
    ///
    /// `None` means a fresh datasource: no prior position, no snapshot
    /// history.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.file_path.exists() {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        match fs::read_to_string(&self.file_path).await {
            Ok(content) => match serde_json::from_str::<Checkpoint>(&content) {
                Ok(checkpoint) => {
                    info!(
                        "Loaded checkpoint: LSN={}, snapshot_in_effect={}",
                        checkpoint.lsn, checkpoint.snapshot_in_effect
                    );
                    Ok(Some(checkpoint))
                }
                Err(e) => {
                    error!("Failed to parse checkpoint file: {}", e);
                    Err(Error::Connection(format!("Invalid checkpoint file: {}", e)))
                }
            },
            Err(e) => {
                error!("Failed to read checkpoint file: {}", e);
                Err(Error::Io(e))
            }
        }
    }

    /// Saves the checkpoint atomically (write temp, sync, rename).
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: LSN={}", checkpoint.lsn);

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint file if it exists, resetting replication to
    /// start from the beginning.
    pub async fn delete(&self) -> Result<()> {
        if self.file_path.exists() {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file");
        }
        Ok(())
    }
}
