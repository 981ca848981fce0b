//! Backend wrapper that forces all writes into one directory.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Backend, BackendError, Capability, EditResult, ExecResult, Record, WriteResult,
};

/// Wrapper that re-maps every write/edit into a confinement directory.
///
/// The final component of the requested path becomes the file name and is
/// placed directly under the confinement directory, so the wrapped agent
/// cannot write into arbitrary locations (`/`, `/home/user`, host-specific
/// paths). Reads, listings and capability queries delegate to the inner
/// backend unchanged.
pub struct WriteConfinedBackend {
    inner: Arc<dyn Backend>,
    dir: String,
}

impl fmt::Debug for WriteConfinedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteConfinedBackend")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl WriteConfinedBackend {
    /// Wrap `inner`, confining writes to `dir` (a virtual directory path
    /// starting with `/`).
    pub fn new(inner: Arc<dyn Backend>, dir: impl Into<String>) -> Result<Self, BackendError> {
        let dir = dir.into();
        if !dir.starts_with('/') {
            return Err(BackendError::InvalidPath(dir));
        }
        Ok(Self {
            inner,
            dir: dir.trim_end_matches('/').to_string(),
        })
    }

    /// Map any write/edit target to `<dir>/<basename>`.
    ///
    /// A path with no usable final component falls back to `output.txt`.
    fn map_write_path(&self, path: &str) -> String {
        let name = path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("output.txt");
        format!("{}/{}", self.dir, name)
    }
}

#[async_trait]
impl Backend for WriteConfinedBackend {
    async fn read(&self, path: &str) -> Result<Record, BackendError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult, BackendError> {
        self.inner.write(&self.map_write_path(path), content).await
    }

    async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult, BackendError> {
        self.inner.edit(&self.map_write_path(path), old, new).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.inner.list(prefix).await
    }

    fn capabilities(&self, path: &str) -> Vec<Capability> {
        self.inner.capabilities(path)
    }

    async fn execute(&self, command: &str) -> Result<ExecResult, BackendError> {
        self.inner.execute(command).await
    }
}
