//! Durable tracking of the replication position
//!
//! The position is the `(log name, offset)` coordinate of the last applied
//! binlog event. It is persisted to a single `master.info` file under the
//! configured data directory so that a restart resumes from the last
//! checkpoint instead of replaying the whole log.
//!
//! Saves are crash-safe: the file is rewritten through a temp file, fsynced,
//! then renamed over the old one. A partially written checkpoint is never
//! observed.

use crate::error::{Result, RiverError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Name of the checkpoint file inside the data directory
const POSITION_FILE: &str = "master.info";

/// A binlog coordinate: log file name plus byte offset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub name: String,
    pub pos: u32,
}

impl Position {
    pub fn new<S: Into<String>>(name: S, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// The zero position, meaning "no checkpoint yet".
    pub fn is_zero(&self) -> bool {
        self.name.is_empty() && self.pos == 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

/// File-backed store for the replication position
///
/// Owned by the sync loop, which is the only caller of [`PositionStore::save`].
/// Observed saves must be monotone non-decreasing; a violation is a
/// programming error in the caller.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    last_saved: Mutex<Option<Position>>,
}

impl PositionStore {
    /// Open the store under `data_dir`, creating the directory if needed.
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await.map_err(|e| {
            RiverError::position_save(format!(
                "failed to create data dir {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            path: data_dir.join(POSITION_FILE),
            last_saved: Mutex::new(None),
        })
    }

    /// Load the persisted position; the zero position when no file exists.
    pub async fn load(&self) -> Result<Position> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no position file at {}, starting fresh", self.path.display());
                return Ok(Position::default());
            }
            Err(e) => {
                return Err(RiverError::position_save(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let position: Position = toml::from_str(&text).map_err(|e| {
            RiverError::position_save(format!("corrupt position file {}: {}", self.path.display(), e))
        })?;

        info!("loaded position {} from {}", position, self.path.display());
        Ok(position)
    }

    /// Persist a position atomically (temp file, fsync, rename).
    pub async fn save(&self, position: &Position) -> Result<()> {
        {
            let last = self.last_saved.lock().unwrap();
            if let Some(ref last) = *last {
                let regressed = last.name == position.name && position.pos < last.pos;
                debug_assert!(!regressed, "position save regressed: {} < {}", position, last);
                if regressed {
                    warn!("position save regressed: {} < {}", position, last);
                }
            }
        }

        let body = toml::to_string(position)
            .map_err(|e| RiverError::position_save(format!("encode failed: {}", e)))?;

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| RiverError::position_save(format!("create {} failed: {}", tmp.display(), e)))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| RiverError::position_save(format!("write failed: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| RiverError::position_save(format!("fsync failed: {}", e)))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RiverError::position_save(format!("rename failed: {}", e)))?;

        *self.last_saved.lock().unwrap() = Some(position.clone());
        Ok(())
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
