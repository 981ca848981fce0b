//! Session-scoped state for ephemeral storage.
//!
//! A session is the unit of conversational continuity: the scope of
//! ephemeral storage and of the coordinator's mutual-exclusion lock.
//! [`SessionFiles`] holds the merged record mapping for one session;
//! [`EphemeralBackend`](crate::EphemeralBackend) reads it directly and
//! proposes mutations as [`PendingUpdate`]s that only the session owner
//! applies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::{PendingUpdate, Record};

/// Compose a session id from an application tag, user id and conversation
/// id: `"app::user::conversation"`.
///
/// Any opaque string works as a session id; this helper exists for callers
/// that key sessions by upstream identity.
pub fn session_key(app: &str, user_id: &str, conversation_id: &str) -> String {
    format!("{app}::{user_id}::{conversation_id}")
}

/// The merged record mapping owned by one session.
///
/// Mutated only through [`SessionFiles::apply`] and
/// [`SessionFiles::clear`], which the coordinator calls while holding the
/// session's turn lock. Backends never mutate it directly.
#[derive(Debug, Clone, Default)]
pub struct SessionFiles {
    records: BTreeMap<String, Record>,
}

impl SessionFiles {
    /// Create an empty file mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the record at `path`.
    pub fn get(&self, path: &str) -> Option<&Record> {
        self.records.get(path)
    }

    /// Paths of all records starting with `prefix`, sorted.
    pub fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.records
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge a proposed update into the mapping, upserting each record by
    /// path.
    pub fn apply(&mut self, update: PendingUpdate) {
        for record in update.records {
            self.records.insert(record.path.clone(), record);
        }
    }

    /// Discard all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Snapshot the mapping for checkpointing.
    pub fn to_snapshot(&self, turns_completed: u64) -> SessionSnapshot {
        SessionSnapshot {
            records: self.records.clone(),
            turns_completed,
        }
    }

    /// Restore the mapping from a checkpoint snapshot.
    pub fn restore(&mut self, snapshot: &SessionSnapshot) {
        self.records = snapshot.records.clone();
    }
}

/// Serialized form of one session's state: the merged record mapping plus
/// session-scoped counters. Written as one blob per session id after each
/// successfully completed turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Merged record mapping, keyed by path.
    pub records: BTreeMap<String, Record>,
    /// Number of turns completed in this session.
    pub turns_completed: u64,
}
