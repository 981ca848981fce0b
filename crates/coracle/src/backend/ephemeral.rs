//! Session-scoped in-memory backend with pending-update write semantics.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    Backend, BackendError, Capability, EditResult, FILE_CAPABILITIES, PendingUpdate, Record,
    WriteResult,
};
use crate::session::SessionFiles;

/// In-process, session-scoped storage.
///
/// The backing store is the session's own [`SessionFiles`] mapping, shared
/// with the coordinator. `write`/`edit` never mutate it: they return a
/// [`PendingUpdate`] describing the new record, which the session owner
/// merges as an atomic step coincident with checkpointing. `read`/`list`
/// see the current merged state directly.
///
/// Lifecycle: created per session on first access and simply unreferenced
/// when the session ends; there is no explicit teardown.
pub struct EphemeralBackend {
    files: Arc<RwLock<SessionFiles>>,
}

impl std::fmt::Debug for EphemeralBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralBackend").finish_non_exhaustive()
    }
}

impl EphemeralBackend {
    /// Create a backend over the session's shared file mapping.
    ///
    /// Obtain the mapping from
    /// [`ExecutionCoordinator::session_files`](crate::ExecutionCoordinator::session_files)
    /// so reads observe every merged turn.
    pub fn new(files: Arc<RwLock<SessionFiles>>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl Backend for EphemeralBackend {
    async fn read(&self, path: &str) -> Result<Record, BackendError> {
        let files = self.files.read().await;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let files = self.files.read().await;
        let record = match files.get(path) {
            Some(existing) => Record::replacing(existing, content),
            None => Record::new(path, content),
        };
        Ok(WriteResult {
            path: path.to_string(),
            pending: Some(PendingUpdate::upsert(record)),
        })
    }

    async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult, BackendError> {
        let files = self.files.read().await;
        let existing = files
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;

        let matches = existing.content.matches(old).count();
        if matches != 1 {
            return Err(BackendError::AmbiguousEdit {
                path: path.to_string(),
                matches,
            });
        }

        let content = existing.content.replacen(old, new, 1);
        let record = Record::replacing(existing, content);
        Ok(EditResult {
            path: path.to_string(),
            pending: Some(PendingUpdate::upsert(record)),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let files = self.files.read().await;
        Ok(files.paths_with_prefix(prefix))
    }

    fn capabilities(&self, _path: &str) -> Vec<Capability> {
        FILE_CAPABILITIES.to_vec()
    }
}
