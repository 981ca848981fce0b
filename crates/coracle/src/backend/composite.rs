//! Longest-prefix path routing across multiple backends.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Backend, BackendError, Capability, EditResult, ExecResult, Record, WriteResult,
};

/// A path-prefix-to-backend mapping.
pub struct Route {
    prefix: String,
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Builder for constructing a [`CompositeRouter`].
///
/// # Example
///
/// ```rust,ignore
/// let router = CompositeRouter::builder(ephemeral)
///     .route("/memories/", persistent)?
///     .route("/docs/", docs)?
///     .build();
/// ```
pub struct CompositeRouterBuilder {
    routes: Vec<Route>,
    default: Arc<dyn Backend>,
}

impl fmt::Debug for CompositeRouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeRouterBuilder")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl CompositeRouterBuilder {
    /// Add a route. The prefix must start with `/`.
    pub fn route(
        mut self,
        prefix: impl Into<String>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, BackendError> {
        let prefix = prefix.into();
        if !prefix.starts_with('/') {
            return Err(BackendError::InvalidPath(prefix));
        }
        self.routes.push(Route { prefix, backend });
        Ok(self)
    }

    /// Build the router. Routes are sorted longest-prefix-first so the
    /// most specific route wins when prefixes overlap.
    pub fn build(mut self) -> CompositeRouter {
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        CompositeRouter {
            routes: self.routes,
            default: self.default,
        }
    }
}

/// Longest-prefix path router over multiple backends with one default.
///
/// For a path `p`, the first route (longest prefix first) whose prefix is
/// a string prefix of `p` wins; the prefix is stripped and the remainder is
/// re-anchored at exactly one leading slash (an exact-prefix match resolves
/// to `/`). Paths matching no route go to the default backend unchanged.
///
/// All operations delegate through this resolution step. Two result-shape
/// conventions keep the router transparent to callers:
///
/// - `list`/`glob` results are re-joined with the matched prefix so every
///   returned path remains addressable through the router;
/// - `WriteResult`/`EditResult` report the path the caller used.
///
/// Capabilities are never merged globally: [`CompositeRouter::capabilities`]
/// answers for the backend the given path resolves to. `execute` delegates
/// to the default backend, since it carries no path to route on.
///
/// The route table is immutable after construction, so routing itself
/// requires no locking; only the backing stores need coordination, which
/// the coordinator's per-session lock provides.
pub struct CompositeRouter {
    routes: Vec<Route>,
    default: Arc<dyn Backend>,
}

impl fmt::Debug for CompositeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeRouter")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving one path against the route table.
struct Resolved {
    backend: Arc<dyn Backend>,
    /// Path as the selected backend sees it.
    stripped: String,
    /// Prefix of the matched route, `None` for the default backend.
    prefix: Option<String>,
}

impl CompositeRouter {
    /// Start building a router with the mandatory default backend.
    pub fn builder(default: Arc<dyn Backend>) -> CompositeRouterBuilder {
        CompositeRouterBuilder {
            routes: Vec::new(),
            default,
        }
    }

    /// Resolve `path` to a backend and the path that backend will see.
    ///
    /// Returns the stripped path and the matched route prefix (empty for
    /// the default backend). Exposed so callers can inspect routing
    /// decisions without performing an operation.
    pub fn resolve_path(&self, path: &str) -> (String, String) {
        let resolved = self.resolve(path);
        (resolved.prefix.unwrap_or_default(), resolved.stripped)
    }

    fn resolve(&self, path: &str) -> Resolved {
        for route in &self.routes {
            if let Some(rest) = path.strip_prefix(route.prefix.as_str()) {
                let stripped = format!("/{}", rest.trim_start_matches('/'));
                tracing::debug!(
                    path = %path,
                    prefix = %route.prefix,
                    resolved = %stripped,
                    "routed path"
                );
                return Resolved {
                    backend: Arc::clone(&route.backend),
                    stripped,
                    prefix: Some(route.prefix.clone()),
                };
            }
        }
        Resolved {
            backend: Arc::clone(&self.default),
            stripped: path.to_string(),
            prefix: None,
        }
    }

    /// Re-join a backend-relative path with the matched route prefix.
    fn rejoin(prefix: Option<&str>, path: &str) -> String {
        match prefix {
            Some(prefix) => format!("{}{}", prefix.trim_end_matches('/'), path),
            None => path.to_string(),
        }
    }
}

#[async_trait]
impl Backend for CompositeRouter {
    async fn read(&self, path: &str) -> Result<Record, BackendError> {
        let resolved = self.resolve(path);
        resolved.backend.read(&resolved.stripped).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult, BackendError> {
        let resolved = self.resolve(path);
        let result = resolved.backend.write(&resolved.stripped, content).await?;
        Ok(WriteResult {
            path: path.to_string(),
            pending: result.pending,
        })
    }

    async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult, BackendError> {
        let resolved = self.resolve(path);
        let result = resolved
            .backend
            .edit(&resolved.stripped, old, new)
            .await?;
        Ok(EditResult {
            path: path.to_string(),
            pending: result.pending,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let resolved = self.resolve(prefix);
        let listed = resolved.backend.list(&resolved.stripped).await?;
        Ok(listed
            .iter()
            .map(|p| Self::rejoin(resolved.prefix.as_deref(), p))
            .collect())
    }

    fn capabilities(&self, path: &str) -> Vec<Capability> {
        let resolved = self.resolve(path);
        resolved.backend.capabilities(&resolved.stripped)
    }

    async fn execute(&self, command: &str) -> Result<ExecResult, BackendError> {
        self.default.execute(command).await
    }

    /// Match against every routed backend as well as the default, since a
    /// pattern may span routes.
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| BackendError::InvalidPath(format!("bad glob pattern: {e}")))?;
        let mut matched = Vec::new();
        for route in &self.routes {
            let listed = route.backend.list("/").await?;
            matched.extend(
                listed
                    .iter()
                    .map(|p| Self::rejoin(Some(route.prefix.as_str()), p))
                    .filter(|p| pattern.matches(p)),
            );
        }
        matched.extend(
            self.default
                .list("/")
                .await?
                .into_iter()
                .filter(|p| pattern.matches(p)),
        );
        matched.sort();
        matched.dedup();
        Ok(matched)
    }
}
