//! Session state checkpointing.
//!
//! When a checkpointer is configured, the coordinator writes one serialized
//! blob per session id after each successfully completed turn and reloads
//! it on first access, so conversations resume across process restarts.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::session::SessionSnapshot;

/// Errors from a [`SessionCheckpointer`].
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// IO error from the checkpoint store.
    #[error("checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure while persisting the snapshot.
    #[error("checkpoint serialization error: {0}")]
    Serde(String),
}

/// Durable store for per-session state blobs.
#[async_trait]
pub trait SessionCheckpointer: Send + Sync {
    /// Persist a snapshot for `session_id`, replacing any existing one.
    async fn save(
        &self,
        session_id: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), CheckpointError>;

    /// Load the snapshot for `session_id`, if one exists.
    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, CheckpointError>;

    /// Remove the snapshot for `session_id`. Removing a missing snapshot
    /// is not an error.
    async fn remove(&self, session_id: &str) -> Result<(), CheckpointError>;
}

/// File-per-session JSON checkpoint store with atomic writes.
///
/// Each save writes a `.tmp` sibling and atomically renames it over the
/// blob, so a crash mid-write never corrupts the previous checkpoint. A
/// blob that fails to parse is logged and treated as absent rather than
/// refusing to start the session.
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl fmt::Debug for JsonCheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCheckpointStore")
            .field("dir", &self.dir)
            .finish()
    }
}

impl JsonCheckpointStore {
    /// Create a store writing blobs under `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, session_id: &str) -> PathBuf {
        let stem: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{stem}.json"))
    }
}

#[async_trait]
impl SessionCheckpointer for JsonCheckpointStore {
    async fn save(
        &self,
        session_id: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| CheckpointError::Serde(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.blob_path(session_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, CheckpointError> {
        let path = self.blob_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    path = %path.display(),
                    error = %err,
                    "failed to load session checkpoint; starting fresh"
                );
                Ok(None)
            }
        }
    }

    async fn remove(&self, session_id: &str) -> Result<(), CheckpointError> {
        let path = self.blob_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
