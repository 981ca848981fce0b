//! Offloading of oversized tool results to storage.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{Backend, PendingUpdate};
use crate::config::EvictionPolicy;

/// Outcome of intercepting one tool result.
#[derive(Debug, Clone)]
pub enum EvictionOutcome {
    /// Result was below the threshold and passes through unchanged.
    Passthrough(String),
    /// Result was written to storage; the caller sees a path reference.
    Evicted {
        /// Path the full content was written to.
        path: String,
        /// Length of the original content in characters.
        chars: usize,
        /// Pending update from the write, when the path resolved to a
        /// backend with deferred writes; the caller must merge it for the
        /// content to become readable.
        pending: Option<PendingUpdate>,
    },
    /// The storage write failed; the original content is returned inline
    /// with a warning rather than lost.
    Degraded {
        /// The original, unevicted content.
        content: String,
        /// Why eviction failed.
        warning: String,
    },
}

impl EvictionOutcome {
    /// The text the tool caller should see in place of the raw result.
    pub fn message(&self) -> String {
        match self {
            Self::Passthrough(content) => content.clone(),
            Self::Evicted { path, chars, .. } => format!(
                "Result too large to return inline ({chars} chars). \
                 Full content written to {path}; read it from there as needed."
            ),
            Self::Degraded { content, warning } => {
                format!("{content}\n\n[warning: result eviction failed: {warning}]")
            }
        }
    }

    /// Pending update produced by an eviction write, if any.
    pub fn pending(&self) -> Option<&PendingUpdate> {
        match self {
            Self::Evicted { pending, .. } => pending.as_ref(),
            _ => None,
        }
    }
}

/// Detects oversized tool output, offloads it through the active backend
/// and substitutes a short path reference.
///
/// Eviction paths are `<dir>/<sanitized call id>-<sequence>.txt`. The
/// per-evictor sequence counter keeps repeated calls with the same id (or
/// ids that sanitize to the same string) from colliding within a session.
pub struct ResultEvictor {
    backend: Arc<dyn Backend>,
    policy: EvictionPolicy,
    sequence: AtomicU64,
}

impl fmt::Debug for ResultEvictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultEvictor")
            .field("policy", &self.policy)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl ResultEvictor {
    /// Create an evictor writing through `backend` (typically the session's
    /// [`CompositeRouter`](crate::CompositeRouter)).
    pub fn new(backend: Arc<dyn Backend>, policy: EvictionPolicy) -> Self {
        Self {
            backend,
            policy,
            sequence: AtomicU64::new(0),
        }
    }

    /// Intercept one tool result before it is returned to the caller.
    ///
    /// Results at or below the threshold pass through unchanged. Larger
    /// results are written to a deterministic path derived from `call_id`;
    /// if the write fails the original content is returned inline with a
    /// warning annotation rather than lost.
    pub async fn intercept(&self, call_id: &str, result: String) -> EvictionOutcome {
        if result.len() <= self.policy.max_inline_chars {
            return EvictionOutcome::Passthrough(result);
        }

        let path = self.result_path(call_id);
        let chars = result.len();
        match self.backend.write(&path, &result).await {
            Ok(write) => EvictionOutcome::Evicted {
                path: write.path,
                chars,
                pending: write.pending,
            },
            Err(err) => {
                tracing::warn!(
                    call_id = %call_id,
                    path = %path,
                    error = %err,
                    "failed to evict oversized result; returning content inline"
                );
                EvictionOutcome::Degraded {
                    content: result,
                    warning: err.to_string(),
                }
            }
        }
    }

    fn result_path(&self, call_id: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let dir = self.policy.result_dir.trim_end_matches('/');
        format!("{dir}/{}-{sequence:04}.txt", sanitize(call_id))
    }
}

/// Reduce an identifier to a filesystem-safe stem.
fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "call".to_string()
    } else {
        cleaned
    }
}
