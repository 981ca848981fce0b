//! Per-session turn serialization and dispatch.
//!
//! The [`ExecutionCoordinator`] owns one execution record per session id
//! and guarantees at most one in-flight turn per session: concurrent
//! requests for the same session wait FIFO on the session's lock rather
//! than racing on ephemeral or persistent state. The turn computation
//! itself is an opaque, possibly blocking [`TurnRunner`] dispatched to a
//! bounded [`WorkerPool`]; streamed turns relay chunks through the
//! [`stream`](crate::StreamEvent) bridge.
//!
//! Backend graphs are constructed per session from
//! [`ExecutionCoordinator::session_files`] and passed into tool-execution
//! code by reference; the coordinator holds no process-wide storage
//! singletons.

mod stream;
mod worker;

pub use stream::{ChunkEmitter, StreamEvent, TurnStream};
pub use worker::WorkerPool;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::checkpoint::SessionCheckpointer;
use crate::config::CoordinatorLimits;
use crate::session::SessionFiles;

/// Errors that end a turn.
///
/// Turn failures are per-turn: the session returns to service for the next
/// turn, never poisoned.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The wrapped computation itself failed.
    #[error("turn execution failed: {0}")]
    Execution(String),
    /// The stream consumer observed no chunk within the idle window.
    #[error("no stream activity within {0:?}")]
    StreamTimeout(Duration),
}

/// Execution phase of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No turn in flight.
    Idle,
    /// A turn is executing.
    Running,
    /// The most recent turn failed; the next turn proceeds normally.
    Failed,
}

/// Input to one turn computation.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Session the turn belongs to.
    pub session_id: String,
    /// The user's input for this turn.
    pub input: String,
    /// Zero-based index of this turn within the session.
    pub turn: u64,
}

/// Output of one turn computation.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    /// The assistant's reply text.
    pub reply: String,
    /// Pending updates gathered from ephemeral backend writes during the
    /// turn; the coordinator merges them into session state atomically
    /// with checkpointing.
    pub updates: Vec<crate::backend::PendingUpdate>,
}

impl TurnOutput {
    /// An output carrying only reply text.
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            updates: Vec::new(),
        }
    }
}

/// The opaque, possibly blocking turn computation.
///
/// Runs on a worker thread (or inline under provisioning pressure), so it
/// may block freely. Streamed turns should push text through the emitter
/// and check [`ChunkEmitter::is_cancelled`] between chunks.
pub trait TurnRunner: Send + Sync + 'static {
    /// Execute one turn.
    fn run(&self, request: TurnRequest, emitter: &ChunkEmitter) -> Result<TurnOutput, TurnError>;
}

impl<F> TurnRunner for F
where
    F: Fn(TurnRequest, &ChunkEmitter) -> Result<TurnOutput, TurnError> + Send + Sync + 'static,
{
    fn run(&self, request: TurnRequest, emitter: &ChunkEmitter) -> Result<TurnOutput, TurnError> {
        self(request, emitter)
    }
}

/// Per-session execution state: the turn lock, the ephemeral file mapping
/// and the phase/turn counters. Created on first access for a session id;
/// mutated only by the coordinator.
struct SessionExecution {
    files: Arc<RwLock<SessionFiles>>,
    turn_lock: Mutex<()>,
    phase: std::sync::Mutex<Phase>,
    turns_completed: AtomicU64,
}

impl SessionExecution {
    fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(SessionFiles::new())),
            turn_lock: Mutex::new(()),
            phase: std::sync::Mutex::new(Phase::Idle),
            turns_completed: AtomicU64::new(0),
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    fn phase(&self) -> Phase {
        *self
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for SessionExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionExecution")
            .field("phase", &self.phase())
            .field("turns_completed", &self.turns_completed)
            .finish_non_exhaustive()
    }
}

struct Inner {
    runner: Arc<dyn TurnRunner>,
    pool: WorkerPool,
    limits: CoordinatorLimits,
    checkpointer: Option<Arc<dyn SessionCheckpointer>>,
    sessions: Mutex<HashMap<String, Arc<SessionExecution>>>,
}

/// Builder for an [`ExecutionCoordinator`].
pub struct ExecutionCoordinatorBuilder {
    runner: Arc<dyn TurnRunner>,
    limits: CoordinatorLimits,
    checkpointer: Option<Arc<dyn SessionCheckpointer>>,
}

impl fmt::Debug for ExecutionCoordinatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCoordinatorBuilder")
            .field("limits", &self.limits)
            .field("has_checkpointer", &self.checkpointer.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionCoordinatorBuilder {
    /// Set the coordinator limits.
    pub fn limits(mut self, limits: CoordinatorLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Enable session checkpointing through `checkpointer`.
    pub fn checkpointer(mut self, checkpointer: Arc<dyn SessionCheckpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> ExecutionCoordinator {
        ExecutionCoordinator {
            inner: Arc::new(Inner {
                runner: self.runner,
                pool: WorkerPool::new(self.limits.max_workers),
                limits: self.limits,
                checkpointer: self.checkpointer,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Serializes turns per session and bridges blocking computations into
/// streamed responses.
///
/// Cloning is cheap and shares the same session table and worker pool.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("limits", &self.inner.limits)
            .finish_non_exhaustive()
    }
}

impl ExecutionCoordinator {
    /// Create a coordinator with default limits and no checkpointing.
    pub fn new(runner: impl TurnRunner) -> Self {
        Self::builder(runner).build()
    }

    /// Start building a coordinator around `runner`.
    pub fn builder(runner: impl TurnRunner) -> ExecutionCoordinatorBuilder {
        ExecutionCoordinatorBuilder {
            runner: Arc::new(runner),
            limits: CoordinatorLimits::default(),
            checkpointer: None,
        }
    }

    /// The limits this coordinator was built with.
    pub fn limits(&self) -> &CoordinatorLimits {
        &self.inner.limits
    }

    /// Execute one turn and return its output. Turns for the same session
    /// are serialized; turns for different sessions proceed concurrently
    /// up to the worker bound.
    pub async fn invoke(
        &self,
        session_id: &str,
        input: impl Into<String>,
    ) -> Result<TurnOutput, TurnError> {
        let session = self.session(session_id).await;
        self.run_turn(&session, session_id, input.into(), ChunkEmitter::sink())
            .await
    }

    /// Execute one turn, delivering incremental output.
    ///
    /// Returns immediately; the turn waits its FIFO place behind any
    /// in-flight turn for the same session. The stream terminates with a
    /// [`StreamEvent::Final`] or [`StreamEvent::Error`] sentinel.
    pub fn stream(&self, session_id: &str, input: impl Into<String>) -> TurnStream {
        let (emitter, turn_stream) = ChunkEmitter::channel(self.inner.limits.stream_idle_timeout);
        let sentinel = emitter.clone();
        let this = self.clone();
        let session_id = session_id.to_string();
        let input = input.into();
        tokio::spawn(async move {
            let session = this.session(&session_id).await;
            match this.run_turn(&session, &session_id, input, emitter).await {
                Ok(output) => sentinel.finish(output.reply),
                Err(err) => sentinel.fail(err.to_string()),
            }
        });
        turn_stream
    }

    /// Discard a session's ephemeral state and checkpoint blob.
    ///
    /// Persistent-backend records are unaffected. Waits for any in-flight
    /// turn to finish first.
    pub async fn reset(&self, session_id: &str) {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        if let Some(session) = session {
            let _guard = session.turn_lock.lock().await;
            session.files.write().await.clear();
            session.turns_completed.store(0, Ordering::SeqCst);
            session.set_phase(Phase::Idle);
        }
        if let Some(checkpointer) = &self.inner.checkpointer {
            if let Err(err) = checkpointer.remove(session_id).await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %err,
                    "failed to remove session checkpoint"
                );
            }
        }
    }

    /// The session's shared ephemeral file mapping, creating the session
    /// if needed.
    ///
    /// Use this to construct the session's
    /// [`EphemeralBackend`](crate::EphemeralBackend) and backend graph, so
    /// backend reads observe every merged turn.
    pub async fn session_files(&self, session_id: &str) -> Arc<RwLock<SessionFiles>> {
        Arc::clone(&self.session(session_id).await.files)
    }

    /// Current phase of a session, if it exists.
    pub async fn phase(&self, session_id: &str) -> Option<Phase> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(session_id).map(|session| session.phase())
    }

    /// Look up or create the session, restoring its checkpoint on first
    /// access.
    async fn session(&self, session_id: &str) -> Arc<SessionExecution> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get(session_id) {
            return Arc::clone(session);
        }

        let session = Arc::new(SessionExecution::new());
        if let Some(checkpointer) = &self.inner.checkpointer {
            match checkpointer.load(session_id).await {
                Ok(Some(snapshot)) => {
                    session.files.write().await.restore(&snapshot);
                    session
                        .turns_completed
                        .store(snapshot.turns_completed, Ordering::SeqCst);
                    tracing::debug!(
                        session_id = %session_id,
                        records = snapshot.records.len(),
                        turns = snapshot.turns_completed,
                        "restored session from checkpoint"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "failed to load session checkpoint; starting fresh"
                    );
                }
            }
        }
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    /// Run one turn under the session lock: dispatch the computation,
    /// merge its pending updates, checkpoint, and update the phase.
    async fn run_turn(
        &self,
        session: &Arc<SessionExecution>,
        session_id: &str,
        input: String,
        emitter: ChunkEmitter,
    ) -> Result<TurnOutput, TurnError> {
        let _guard = session.turn_lock.lock().await;
        session.set_phase(Phase::Running);

        let request = TurnRequest {
            session_id: session_id.to_string(),
            input,
            turn: session.turns_completed.load(Ordering::SeqCst),
        };
        let runner = Arc::clone(&self.inner.runner);
        let result = self
            .inner
            .pool
            .dispatch(session_id, move || runner.run(request, &emitter))
            .await
            .unwrap_or_else(|| {
                Err(TurnError::Execution(
                    "turn computation panicked".to_string(),
                ))
            });

        match result {
            Ok(output) => {
                // Merging and checkpointing happen under the session lock,
                // so the next turn observes a consistent state.
                {
                    let mut files = session.files.write().await;
                    for update in &output.updates {
                        files.apply(update.clone());
                    }
                }
                let turns = session.turns_completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(checkpointer) = &self.inner.checkpointer {
                    let snapshot = session.files.read().await.to_snapshot(turns);
                    if let Err(err) = checkpointer.save(session_id, &snapshot).await {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %err,
                            "failed to checkpoint session"
                        );
                    }
                }
                session.set_phase(Phase::Idle);
                Ok(output)
            }
            Err(err) => {
                tracing::debug!(session_id = %session_id, error = %err, "turn failed");
                session.set_phase(Phase::Failed);
                Err(err)
            }
        }
    }
}
