//! Durable, namespaced storage over a pluggable key-value store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::{
    Backend, BackendError, Capability, EditResult, FILE_CAPABILITIES, Record, WriteResult,
};

/// Errors from a [`DurableStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error from a disk-backed store.
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure while persisting store contents.
    #[error("store serialization error: {0}")]
    Serde(String),
}

/// Isolation key for persistent storage: an ordered tuple of strings
/// (e.g. `("business-cofounder", "filesystem")`) scoping records to an
/// agent/session group.
///
/// Two distinct namespaces never see each other's records through the same
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(Vec<String>);

impl Namespace {
    /// Create a namespace from its ordered parts.
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The ordered parts of the namespace.
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("::"))
    }
}

/// External durable key-value store, keyed by `(namespace, path)`.
///
/// Implementations must apply `put` synchronously with respect to the call
/// (durability is not deferred) and must keep namespaces fully isolated.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch the record at `(namespace, path)`, if present.
    async fn get(&self, namespace: &Namespace, path: &str)
    -> Result<Option<Record>, StoreError>;

    /// Store a record at `(namespace, path)`, replacing any existing one.
    async fn put(&self, namespace: &Namespace, path: &str, record: Record)
    -> Result<(), StoreError>;

    /// Paths in `namespace` starting with `prefix`, sorted.
    async fn list(&self, namespace: &Namespace, prefix: &str)
    -> Result<Vec<String>, StoreError>;
}

/// Durable, namespaced storage backend.
///
/// Writes and edits apply to the underlying [`DurableStore`] immediately
/// and return no pending update. The namespace is fixed at construction
/// and immutable thereafter; records outlive sessions.
///
/// When distinct sessions share a namespace and write the same path
/// concurrently, the store applies them in arrival order and the last
/// write wins.
pub struct PersistentBackend {
    store: Arc<dyn DurableStore>,
    namespace: Namespace,
}

impl fmt::Debug for PersistentBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentBackend")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl PersistentBackend {
    /// Create a backend over `store`, scoped to `namespace`.
    pub fn new(store: Arc<dyn DurableStore>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    /// The namespace this backend is scoped to.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn read_err(&self, err: StoreError) -> BackendError {
        BackendError::Store(err.to_string())
    }

    fn write_err(&self, path: &str, err: StoreError) -> BackendError {
        BackendError::WriteFailed {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl Backend for PersistentBackend {
    async fn read(&self, path: &str) -> Result<Record, BackendError> {
        self.store
            .get(&self.namespace, path)
            .await
            .map_err(|e| self.read_err(e))?
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let existing = self
            .store
            .get(&self.namespace, path)
            .await
            .map_err(|e| self.read_err(e))?;
        let record = match existing {
            Some(previous) => Record::replacing(&previous, content),
            None => Record::new(path, content),
        };
        self.store
            .put(&self.namespace, path, record)
            .await
            .map_err(|e| self.write_err(path, e))?;
        Ok(WriteResult {
            path: path.to_string(),
            pending: None,
        })
    }

    async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult, BackendError> {
        let existing = self
            .store
            .get(&self.namespace, path)
            .await
            .map_err(|e| self.read_err(e))?
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;

        let matches = existing.content.matches(old).count();
        if matches != 1 {
            return Err(BackendError::AmbiguousEdit {
                path: path.to_string(),
                matches,
            });
        }

        let content = existing.content.replacen(old, new, 1);
        let record = Record::replacing(&existing, content);
        self.store
            .put(&self.namespace, path, record)
            .await
            .map_err(|e| self.write_err(path, e))?;
        Ok(EditResult {
            path: path.to_string(),
            pending: None,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.store
            .list(&self.namespace, prefix)
            .await
            .map_err(|e| self.read_err(e))
    }

    fn capabilities(&self, _path: &str) -> Vec<Capability> {
        FILE_CAPABILITIES.to_vec()
    }
}

/// In-memory [`DurableStore`].
///
/// Share one instance behind an `Arc` across backend constructions to model
/// storage that outlives any single session (or process, in tests).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Namespace, BTreeMap<String, Record>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(
        &self,
        namespace: &Namespace,
        path: &str,
    ) -> Result<Option<Record>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(namespace)
            .and_then(|records| records.get(path))
            .cloned())
    }

    async fn put(
        &self,
        namespace: &Namespace,
        path: &str,
        record: Record,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(namespace.clone())
            .or_default()
            .insert(path.to_string(), record);
        Ok(())
    }

    async fn list(
        &self,
        namespace: &Namespace,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(namespace)
            .map(|records| {
                records
                    .keys()
                    .filter(|p| p.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// On-disk contents of a [`JsonFileStore`]: namespace key -> path -> record.
type FilePayload = BTreeMap<String, BTreeMap<String, Record>>;

/// Single-file, JSON-serialized [`DurableStore`] with atomic writes.
///
/// Every `put` rewrites the file through a `.tmp` sibling followed by an
/// atomic rename, so API calls can resume the same records across process
/// restarts and a crash mid-write never corrupts the previous state. A
/// file that fails to parse is logged and treated as empty rather than
/// refusing to start.
pub struct JsonFileStore {
    file_path: PathBuf,
    entries: RwLock<HashMap<Namespace, BTreeMap<String, Record>>>,
}

impl fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonFileStore")
            .field("file_path", &self.file_path)
            .finish_non_exhaustive()
    }
}

impl JsonFileStore {
    /// Open a store at `file_path`, loading any existing contents.
    pub async fn open(file_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file_path = file_path.as_ref().to_path_buf();
        let entries = Self::load(&file_path).await;
        Ok(Self {
            file_path,
            entries: RwLock::new(entries),
        })
    }

    async fn load(file_path: &Path) -> HashMap<Namespace, BTreeMap<String, Record>> {
        let bytes = match tokio::fs::read(file_path).await {
            Ok(bytes) => bytes,
            Err(_) => return HashMap::new(),
        };
        let payload: FilePayload = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    path = %file_path.display(),
                    error = %err,
                    "failed to load durable store; starting with empty state"
                );
                return HashMap::new();
            }
        };
        payload
            .into_iter()
            .map(|(ns, records)| {
                let namespace = Namespace::new(ns.split("::"));
                (namespace, records)
            })
            .collect()
    }

    async fn dump(
        &self,
        entries: &HashMap<Namespace, BTreeMap<String, Record>>,
    ) -> Result<(), StoreError> {
        let payload: FilePayload = entries
            .iter()
            .map(|(ns, records)| (ns.to_string(), records.clone()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&payload)
            .map_err(|e| StoreError::Serde(e.to_string()))?;

        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.file_path).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn get(
        &self,
        namespace: &Namespace,
        path: &str,
    ) -> Result<Option<Record>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(namespace)
            .and_then(|records| records.get(path))
            .cloned())
    }

    async fn put(
        &self,
        namespace: &Namespace,
        path: &str,
        record: Record,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(namespace.clone())
            .or_default()
            .insert(path.to_string(), record);
        self.dump(&entries).await
    }

    async fn list(
        &self,
        namespace: &Namespace,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(namespace)
            .map(|records| {
                records
                    .keys()
                    .filter(|p| p.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ns(parts: &[&str]) -> Namespace {
        Namespace::new(parts.iter().copied())
    }

    // ==================== Namespace Tests ====================

    #[test]
    fn test_namespace_display() {
        assert_eq!(ns(&["agent-1", "filesystem"]).to_string(), "agent-1::filesystem");
    }

    // ==================== MemoryStore Tests ====================

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let backend = PersistentBackend::new(store, ns(&["a"]));

        backend.write("/notes.md", "hello").await.unwrap();
        let record = backend.read("/notes.md").await.unwrap();
        assert_eq!(record.content, "hello");
    }

    #[tokio::test]
    async fn test_write_returns_no_pending() {
        let store = Arc::new(MemoryStore::new());
        let backend = PersistentBackend::new(store, ns(&["a"]));

        let result = backend.write("/notes.md", "hello").await.unwrap();
        assert!(result.pending.is_none());
    }

    #[tokio::test]
    async fn test_durability_across_backend_instances() {
        let store = Arc::new(MemoryStore::new());

        let first = PersistentBackend::new(Arc::clone(&store) as _, ns(&["a"]));
        first.write("/notes.md", "hello").await.unwrap();
        drop(first);

        // A freshly constructed backend for the same namespace sees the
        // record, simulating a restart.
        let second = PersistentBackend::new(store, ns(&["a"]));
        assert_eq!(second.read("/notes.md").await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let store = Arc::new(MemoryStore::new());
        let backend_a = PersistentBackend::new(Arc::clone(&store) as _, ns(&["a"]));
        let backend_b = PersistentBackend::new(store, ns(&["b"]));

        backend_a.write("/shared.md", "from a").await.unwrap();

        assert!(matches!(
            backend_b.read("/shared.md").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_last_write_wins_within_namespace() {
        let store = Arc::new(MemoryStore::new());
        let writer_1 = PersistentBackend::new(Arc::clone(&store) as _, ns(&["shared"]));
        let writer_2 = PersistentBackend::new(store, ns(&["shared"]));

        writer_1.write("/doc.md", "first").await.unwrap();
        writer_2.write("/doc.md", "second").await.unwrap();

        assert_eq!(writer_1.read("/doc.md").await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_edit_applies_immediately() {
        let store = Arc::new(MemoryStore::new());
        let backend = PersistentBackend::new(store, ns(&["a"]));

        backend.write("/doc.md", "foo baz").await.unwrap();
        let result = backend.edit("/doc.md", "foo", "bar").await.unwrap();
        assert!(result.pending.is_none());
        assert_eq!(backend.read("/doc.md").await.unwrap().content, "bar baz");
    }

    #[tokio::test]
    async fn test_edit_ambiguous() {
        let store = Arc::new(MemoryStore::new());
        let backend = PersistentBackend::new(store, ns(&["a"]));

        backend.write("/doc.md", "foo foo").await.unwrap();
        let err = backend.edit("/doc.md", "foo", "bar").await.unwrap_err();
        assert!(matches!(err, BackendError::AmbiguousEdit { matches: 2, .. }));
    }

    #[tokio::test]
    async fn test_list_and_glob() {
        let store = Arc::new(MemoryStore::new());
        let backend = PersistentBackend::new(store, ns(&["a"]));

        for path in ["/memories/x.md", "/memories/y.md", "/other.txt"] {
            backend.write(path, "x").await.unwrap();
        }

        assert_eq!(
            backend.list("/memories/").await.unwrap(),
            vec!["/memories/x.md", "/memories/y.md"]
        );
        assert_eq!(
            backend.glob("/memories/*.md").await.unwrap(),
            vec!["/memories/x.md", "/memories/y.md"]
        );
    }

    // ==================== JsonFileStore Tests ====================

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        {
            let store = Arc::new(JsonFileStore::open(&file).await.unwrap());
            let backend = PersistentBackend::new(store, ns(&["a"]));
            backend.write("/notes.md", "persisted").await.unwrap();
        }

        let store = Arc::new(JsonFileStore::open(&file).await.unwrap());
        let backend = PersistentBackend::new(store, ns(&["a"]));
        assert_eq!(
            backend.read("/notes.md").await.unwrap().content,
            "persisted"
        );
    }

    #[tokio::test]
    async fn test_file_store_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");
        tokio::fs::write(&file, b"not json at all").await.unwrap();

        let store = Arc::new(JsonFileStore::open(&file).await.unwrap());
        let backend = PersistentBackend::new(store, ns(&["a"]));
        assert!(matches!(
            backend.read("/anything.md").await,
            Err(BackendError::NotFound(_))
        ));

        // The store is usable after the corrupt load.
        backend.write("/fresh.md", "ok").await.unwrap();
        assert_eq!(backend.read("/fresh.md").await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn test_file_store_no_leftover_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        let store = Arc::new(JsonFileStore::open(&file).await.unwrap());
        let backend = PersistentBackend::new(store, ns(&["a"]));
        backend.write("/notes.md", "x").await.unwrap();

        assert!(file.exists());
        assert!(!file.with_extension("json.tmp").exists());
    }
}
