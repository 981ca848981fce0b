//! Host-filesystem-backed backend with no routing logic of its own.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use super::{
    Backend, BackendError, Capability, EditResult, FILE_CAPABILITIES, Record, WriteResult,
};

/// Direct host-filesystem storage rooted at a directory.
///
/// A virtual path `/a/b.txt` maps to `<root>/a/b.txt`. Paths must be
/// absolute and may not traverse out of the root (`..` components are
/// rejected with [`BackendError::InvalidPath`]).
pub struct PassthroughBackend {
    root: PathBuf,
}

impl fmt::Debug for PassthroughBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughBackend")
            .field("root", &self.root)
            .finish()
    }
}

impl PassthroughBackend {
    /// Create a backend rooted at `root`. The directory is created if it
    /// does not exist.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// The host directory this backend is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to its host location.
    fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        if !path.starts_with('/') {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        let relative = Path::new(path.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return Err(BackendError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    async fn read_record(&self, path: &str) -> Result<Record, BackendError> {
        let host_path = self.resolve(path)?;
        let content = match tokio::fs::read_to_string(&host_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(path.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let metadata = tokio::fs::metadata(&host_path).await?;
        let modified_at = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        // Creation time is unavailable on some filesystems; fall back to
        // the modification time.
        let created_at = metadata.created().unwrap_or(modified_at);
        Ok(Record {
            path: path.to_string(),
            content,
            created_at,
            modified_at,
        })
    }

    /// Recursively collect virtual paths under `dir`.
    async fn walk(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<(), BackendError> {
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(entry_path);
                } else if let Ok(relative) = entry_path.strip_prefix(&self.root) {
                    let virtual_path =
                        format!("/{}", relative.to_string_lossy().replace('\\', "/"));
                    out.push(virtual_path);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for PassthroughBackend {
    async fn read(&self, path: &str) -> Result<Record, BackendError> {
        self.read_record(path).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let host_path = self.resolve(path)?;
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&host_path, content)
            .await
            .map_err(|err| BackendError::WriteFailed {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
        Ok(WriteResult {
            path: path.to_string(),
            pending: None,
        })
    }

    async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult, BackendError> {
        let existing = self.read_record(path).await?;

        let matches = existing.content.matches(old).count();
        if matches != 1 {
            return Err(BackendError::AmbiguousEdit {
                path: path.to_string(),
                matches,
            });
        }

        let content = existing.content.replacen(old, new, 1);
        let host_path = self.resolve(path)?;
        tokio::fs::write(&host_path, content)
            .await
            .map_err(|err| BackendError::WriteFailed {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
        Ok(EditResult {
            path: path.to_string(),
            pending: None,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        if !prefix.starts_with('/') {
            return Err(BackendError::InvalidPath(prefix.to_string()));
        }
        let mut paths = Vec::new();
        self.walk(self.root.clone(), &mut paths).await?;
        paths.retain(|p| p.starts_with(prefix));
        paths.sort();
        Ok(paths)
    }

    fn capabilities(&self, _path: &str) -> Vec<Capability> {
        FILE_CAPABILITIES.to_vec()
    }
}
