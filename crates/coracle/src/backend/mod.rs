//! Storage backends for agent-generated artifacts.
//!
//! This module provides:
//! - [`Backend`] - Common contract implemented by every storage backend
//! - [`EphemeralBackend`] - Session-scoped in-memory storage with
//!   pending-update write semantics
//! - [`PersistentBackend`] - Durable, namespaced storage over a
//!   [`DurableStore`]
//! - [`PassthroughBackend`] - Direct host-filesystem-backed storage
//! - [`CompositeRouter`] - Longest-prefix path routing across backends
//! - [`WriteConfinedBackend`] - Wrapper that re-maps all writes into one
//!   directory
//!
//! All paths are absolute and slash-delimited (`/notes/ideas.md`). A backend
//! never sees the routing prefix that selected it: the router strips it
//! before delegating.

mod composite;
mod confined;
mod ephemeral;
mod passthrough;
mod persistent;

pub use composite::{CompositeRouter, CompositeRouterBuilder, Route};
pub use confined::WriteConfinedBackend;
pub use ephemeral::EphemeralBackend;
pub use passthrough::PassthroughBackend;
pub use persistent::{
    DurableStore, JsonFileStore, MemoryStore, Namespace, PersistentBackend, StoreError,
};

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during backend operations.
///
/// All variants are local and recoverable: they are reported to the caller
/// (typically as a tool-visible message) and the turn continues.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Path absent on read/edit.
    #[error("file not found: {0}")]
    NotFound(String),
    /// Edit target matched zero or multiple times; edits must target a
    /// unique occurrence.
    #[error("edit target matched {matches} times in {path}; expected exactly one")]
    AmbiguousEdit {
        /// Path of the record being edited.
        path: String,
        /// Number of occurrences of the old substring.
        matches: usize,
    },
    /// Operation not advertised by the resolved backend's capability set.
    #[error("operation `{op}` not supported by this backend")]
    Unsupported {
        /// Name of the unsupported operation.
        op: &'static str,
    },
    /// The underlying store rejected a write.
    #[error("write failed for {path}: {reason}")]
    WriteFailed {
        /// Path of the rejected write.
        path: String,
        /// Store-reported reason.
        reason: String,
    },
    /// Path is malformed (missing leading slash, traversal, bad pattern).
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// IO error from a filesystem-backed backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error from an underlying durable store.
    #[error("store error: {0}")]
    Store(String),
}

/// A stored file-like record.
///
/// A record is owned exclusively by whichever backend currently stores it;
/// no backend reads another backend's records directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Absolute path of the record, as the owning backend knows it.
    pub path: String,
    /// Record content.
    pub content: String,
    /// When the record was first created.
    #[serde(with = "epoch_ms")]
    pub created_at: SystemTime,
    /// When the record was last modified.
    #[serde(with = "epoch_ms")]
    pub modified_at: SystemTime,
}

impl Record {
    /// Create a new record with both timestamps set to now.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            path: path.into(),
            content: content.into(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Create a record that replaces `previous`, preserving its creation
    /// time.
    pub fn replacing(previous: &Record, content: impl Into<String>) -> Self {
        Self {
            path: previous.path.clone(),
            content: content.into(),
            created_at: previous.created_at,
            modified_at: SystemTime::now(),
        }
    }
}

/// A proposed set of record upserts returned by an ephemeral write/edit.
///
/// The backend that produced it never applies it; the session owner merges
/// it into session state as an atomic step coincident with checkpointing.
/// This separation keeps backends from racing with the session's own
/// checkpoint writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Records to upsert, keyed by their `path` field.
    pub records: Vec<Record>,
}

impl PendingUpdate {
    /// A pending update upserting a single record.
    pub fn upsert(record: Record) -> Self {
        Self {
            records: vec![record],
        }
    }
}

/// Result of a [`Backend::write`].
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// Path the write targeted, as the caller addressed it.
    pub path: String,
    /// Present for backends that cannot apply writes themselves
    /// (ephemeral); absent when the write was applied synchronously.
    pub pending: Option<PendingUpdate>,
}

/// Result of a [`Backend::edit`].
#[derive(Debug, Clone)]
pub struct EditResult {
    /// Path the edit targeted, as the caller addressed it.
    pub path: String,
    /// Present for backends that cannot apply edits themselves (ephemeral);
    /// absent when the edit was applied synchronously.
    pub pending: Option<PendingUpdate>,
}

/// Result of a [`Backend::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Captured standard output.
    pub stdout: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Whether output was truncated due to limits.
    pub truncated: bool,
}

/// Optional operations a backend may advertise.
///
/// Callers must check [`Backend::capabilities`] before invoking
/// non-universal operations such as [`Backend::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read records.
    Read,
    /// Write records.
    Write,
    /// Edit records in place.
    Edit,
    /// List records by path prefix.
    List,
    /// Execute commands (never advertised by the shipped backends).
    Execute,
}

/// The capability set shared by all file-storage backends.
pub const FILE_CAPABILITIES: &[Capability] = &[
    Capability::Read,
    Capability::Write,
    Capability::Edit,
    Capability::List,
];

/// Common contract implemented by every storage backend.
///
/// Backends are used behind `Arc<dyn Backend>` so a session's backend graph
/// can be composed at construction time and shared with the coordinator.
/// Routing carries no mutable state, so backends need no locking of their
/// own beyond what their backing store requires.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read the record at `path`.
    async fn read(&self, path: &str) -> Result<Record, BackendError>;

    /// Write `content` to `path`, creating or replacing the record.
    ///
    /// Backends that cannot apply writes themselves return the proposed
    /// mutation in [`WriteResult::pending`]; the session owner merges it.
    async fn write(&self, path: &str, content: &str) -> Result<WriteResult, BackendError>;

    /// Replace a unique occurrence of `old` with `new` in the record at
    /// `path`.
    ///
    /// Fails with [`BackendError::NotFound`] if the path is absent and
    /// [`BackendError::AmbiguousEdit`] if `old` occurs zero or multiple
    /// times.
    async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult, BackendError>;

    /// List the paths of all records whose path starts with `prefix`,
    /// sorted. The listing is finite and restartable by re-invocation.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// The operations this backend supports for `path`.
    ///
    /// Plain backends return the same set for every path; a
    /// [`CompositeRouter`] answers for the backend the path resolves to, so
    /// callers must re-check after resolving a specific path.
    fn capabilities(&self, path: &str) -> Vec<Capability>;

    /// Execute a command, if the backend advertises
    /// [`Capability::Execute`].
    async fn execute(&self, _command: &str) -> Result<ExecResult, BackendError> {
        Err(BackendError::Unsupported { op: "execute" })
    }

    /// List the paths of all records matching a glob `pattern`.
    ///
    /// Implemented over [`Backend::list`]; `*` matches any sequence of
    /// characters including `/`.
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| BackendError::InvalidPath(format!("bad glob pattern: {e}")))?;
        let mut matched: Vec<String> = self
            .list("/")
            .await?
            .into_iter()
            .filter(|p| pattern.matches(p))
            .collect();
        matched.sort();
        Ok(matched)
    }
}

/// Helper for serializing `SystemTime` as milliseconds since the Unix
/// epoch.
mod epoch_ms {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        ms.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(ms))
    }
}
