//! Coracle: virtual storage routing and turn coordination for
//! conversational agents.
//!
//! Coracle provides the storage and concurrency core of a
//! conversational-agent service: a virtual filesystem whose paths route to
//! ephemeral, persistent or host-filesystem backends by longest prefix,
//! and a coordinator that serializes agent turns per session while
//! bridging blocking computations into streamed responses.
//!
//! - [`Backend`] and its implementations ([`EphemeralBackend`],
//!   [`PersistentBackend`], [`PassthroughBackend`], [`CompositeRouter`],
//!   [`WriteConfinedBackend`]) store agent-generated artifacts.
//! - [`ResultEvictor`] offloads oversized tool results to storage and
//!   substitutes a path reference.
//! - [`ExecutionCoordinator`] guarantees at most one in-flight turn per
//!   session, dispatches the blocking [`TurnRunner`] to a bounded
//!   [`WorkerPool`] (with inline fallback under provisioning pressure),
//!   merges ephemeral [`PendingUpdate`]s and checkpoints session state.

mod backend;
mod checkpoint;
mod config;
mod coordinator;
mod evictor;
mod session;

pub use backend::{
    Backend, BackendError, Capability, CompositeRouter, CompositeRouterBuilder, DurableStore,
    EditResult, EphemeralBackend, ExecResult, FILE_CAPABILITIES, JsonFileStore, MemoryStore,
    Namespace, PassthroughBackend, PendingUpdate, PersistentBackend, Record, Route, StoreError,
    WriteConfinedBackend, WriteResult,
};
pub use checkpoint::{CheckpointError, JsonCheckpointStore, SessionCheckpointer};
pub use config::{CoordinatorLimits, EvictionPolicy};
pub use coordinator::{
    ChunkEmitter, ExecutionCoordinator, ExecutionCoordinatorBuilder, Phase, StreamEvent,
    TurnError, TurnOutput, TurnRequest, TurnRunner, TurnStream, WorkerPool,
};
pub use evictor::{EvictionOutcome, ResultEvictor};
pub use session::{SessionFiles, SessionSnapshot, session_key};
