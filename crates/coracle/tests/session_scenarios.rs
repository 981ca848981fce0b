//! Cross-module scenarios: routing, durability, eviction, serialization
//! and streaming through the public API.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use coracle::{
    Backend, BackendError, ChunkEmitter, CompositeRouter, CoordinatorLimits, EphemeralBackend,
    EvictionOutcome, EvictionPolicy, ExecutionCoordinator, JsonCheckpointStore, MemoryStore,
    Namespace, PersistentBackend, ResultEvictor, StreamEvent, TurnOutput, TurnRequest,
    WriteConfinedBackend, session_key,
};

fn persistent(store: &Arc<MemoryStore>, namespace: &str) -> Arc<dyn Backend> {
    Arc::new(PersistentBackend::new(
        Arc::clone(store) as _,
        Namespace::new([namespace]),
    ))
}

/// Build the canonical session environment: `/memories/` persistent,
/// everything else ephemeral.
async fn session_router(
    coordinator: &ExecutionCoordinator,
    session_id: &str,
    store: &Arc<MemoryStore>,
) -> Arc<CompositeRouter> {
    let files = coordinator.session_files(session_id).await;
    let ephemeral: Arc<dyn Backend> = Arc::new(EphemeralBackend::new(files));
    Arc::new(
        CompositeRouter::builder(ephemeral)
            .route("/memories/", persistent(store, "agent"))
            .unwrap()
            .build(),
    )
}

fn echo_runner() -> impl coracle::TurnRunner {
    |request: TurnRequest, _emitter: &ChunkEmitter| {
        Ok(TurnOutput::reply(format!("echo: {}", request.input)))
    }
}

// ==================== Routing + Durability Scenario ====================

/// Memories survive a restart; scratch files do not.
#[tokio::test]
async fn test_memories_survive_restart_scratch_does_not() {
    let store = Arc::new(MemoryStore::new());

    // First session lifetime.
    {
        let coordinator = ExecutionCoordinator::new(echo_runner());
        let router = session_router(&coordinator, "s1", &store).await;

        let memories = router.write("/memories/notes.md", "hello").await.unwrap();
        assert!(memories.pending.is_none());

        let scratch = router.write("/scratch.txt", "temp").await.unwrap();
        let files = coordinator.session_files("s1").await;
        files.write().await.apply(scratch.pending.unwrap());

        assert_eq!(router.read("/scratch.txt").await.unwrap().content, "temp");
    }

    // Reopen: same durable store and namespace, fresh session state.
    let coordinator = ExecutionCoordinator::new(echo_runner());
    let router = session_router(&coordinator, "s1", &store).await;

    assert_eq!(
        router.read("/memories/notes.md").await.unwrap().content,
        "hello"
    );
    assert!(matches!(
        router.read("/scratch.txt").await,
        Err(BackendError::NotFound(_))
    ));
}

// ==================== Edit Scenario ====================

/// An ambiguous edit fails; a unique edit succeeds.
#[tokio::test]
async fn test_edit_requires_unique_occurrence() {
    let store = Arc::new(MemoryStore::new());
    let backend = persistent(&store, "agent");

    backend.write("/doc.md", "foo foo").await.unwrap();
    let err = backend.edit("/doc.md", "foo", "bar").await.unwrap_err();
    assert!(matches!(err, BackendError::AmbiguousEdit { matches: 2, .. }));

    backend.write("/doc.md", "foo baz").await.unwrap();
    backend.edit("/doc.md", "foo", "bar").await.unwrap();
    assert_eq!(backend.read("/doc.md").await.unwrap().content, "bar baz");
}

// ==================== Eviction Scenario ====================

/// An oversized result routed through the composite router is readable at
/// the reference path; pending updates from ephemeral routes surface to
/// the caller.
#[tokio::test]
async fn test_eviction_reference_is_readable_through_router() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = ExecutionCoordinator::new(echo_runner());
    let router = session_router(&coordinator, "s1", &store).await;

    // Evict into persistent storage via the /memories/ route.
    let policy = EvictionPolicy {
        max_inline_chars: 64,
        result_dir: "/memories/tool_results".to_string(),
    };
    let evictor = ResultEvictor::new(Arc::clone(&router) as _, policy);

    let oversized = "result line\n".repeat(100);
    let outcome = evictor.intercept("call-7", oversized.clone()).await;
    let EvictionOutcome::Evicted { path, chars, pending } = &outcome else {
        panic!("expected eviction, got {outcome:?}");
    };
    assert_eq!(*chars, oversized.len());
    assert!(pending.is_none(), "persistent route applies immediately");

    let stored = router.read(path).await.unwrap();
    assert_eq!(stored.content, oversized);

    // A small result passes through untouched.
    let small = evictor.intercept("call-8", "tiny".to_string()).await;
    assert_eq!(small.message(), "tiny");
}

/// Eviction through the ephemeral default returns the pending update that
/// the session owner must merge before the reference is readable.
#[tokio::test]
async fn test_eviction_through_ephemeral_surfaces_pending_update() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = ExecutionCoordinator::new(echo_runner());
    let router = session_router(&coordinator, "s1", &store).await;

    let policy = EvictionPolicy {
        max_inline_chars: 8,
        result_dir: "/tool_results".to_string(),
    };
    let evictor = ResultEvictor::new(Arc::clone(&router) as _, policy);

    let outcome = evictor
        .intercept("call-1", "0123456789abcdef".to_string())
        .await;
    let EvictionOutcome::Evicted { path, pending, .. } = &outcome else {
        panic!("expected eviction, got {outcome:?}");
    };

    // Not readable until the owner merges the update.
    assert!(router.read(path).await.is_err());
    let files = coordinator.session_files("s1").await;
    files.write().await.apply(pending.clone().unwrap());
    assert_eq!(
        router.read(path).await.unwrap().content,
        "0123456789abcdef"
    );
}

// ==================== Confinement Scenario ====================

#[tokio::test]
async fn test_confined_writes_land_in_docs_dir() {
    let store = Arc::new(MemoryStore::new());
    let inner = persistent(&store, "docs");
    let confined = WriteConfinedBackend::new(inner, "/docs").unwrap();

    let result = confined
        .write("/deep/nested/report.md", "findings")
        .await
        .unwrap();
    assert_eq!(result.path, "/docs/report.md");
    assert_eq!(
        confined.read("/docs/report.md").await.unwrap().content,
        "findings"
    );
    assert_eq!(confined.list("/docs/").await.unwrap(), vec!["/docs/report.md"]);
}

// ==================== Serialization Scenario ====================

/// Two concurrent invokes for one session never overlap; a shared gauge
/// never observes two in-flight turns.
#[tokio::test]
async fn test_concurrent_invokes_are_serialized_per_session() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runner = {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        move |request: TurnRequest, _emitter: &ChunkEmitter| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(25));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(TurnOutput::reply(request.input))
        }
    };
    let coordinator = ExecutionCoordinator::new(runner);

    let session = session_key("app", "user-1", "default");
    let (a, b, c) = tokio::join!(
        coordinator.invoke(&session, "one"),
        coordinator.invoke(&session, "two"),
        coordinator.invoke(&session, "three"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

// ==================== Streaming Scenario ====================

/// Chunks arrive in production order for a long stream, then the sentinel.
#[tokio::test]
async fn test_stream_preserves_order_over_many_chunks() {
    let runner = |_request: TurnRequest, emitter: &ChunkEmitter| {
        for i in 0..120 {
            if !emitter.delta(format!("{i} ")) {
                break;
            }
        }
        Ok(TurnOutput::reply("counted"))
    };
    let coordinator = ExecutionCoordinator::new(runner);

    let mut stream = coordinator.stream("s1", "count");
    let mut expected = 0;
    loop {
        match stream.next_event().await.unwrap().unwrap() {
            StreamEvent::Delta { text } => {
                assert_eq!(text, format!("{expected} "));
                expected += 1;
            }
            StreamEvent::Final { text } => {
                assert_eq!(text, "counted");
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(expected, 120);
}

/// Dropping the stream sets the cooperative cancellation flag; the
/// producer stops at the next chunk boundary.
#[tokio::test]
async fn test_dropping_stream_cancels_producer() {
    let emitted = Arc::new(AtomicUsize::new(0));
    let runner = {
        let emitted = Arc::clone(&emitted);
        move |_request: TurnRequest, emitter: &ChunkEmitter| {
            for i in 0..1_000 {
                std::thread::sleep(Duration::from_millis(1));
                if !emitter.delta(format!("chunk-{i}")) {
                    break;
                }
                emitted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(TurnOutput::reply("done"))
        }
    };
    let coordinator = ExecutionCoordinator::new(runner);

    let mut stream = coordinator.stream("s1", "go");
    // Consume a few chunks, then disconnect.
    for _ in 0..3 {
        stream.next_event().await.unwrap().unwrap();
    }
    drop(stream);

    // Wait for the turn to wind down, then confirm the producer stopped
    // far short of its 1000-chunk budget.
    for _ in 0..200 {
        if coordinator.phase("s1").await == Some(coracle::Phase::Idle) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(emitted.load(Ordering::SeqCst) < 500);
}

/// A stalled producer surfaces a stream timeout and the session recovers.
#[tokio::test]
async fn test_stalled_stream_times_out() {
    let runner = |_request: TurnRequest, emitter: &ChunkEmitter| {
        emitter.delta("first");
        // Stall past the idle window, checking for cancellation.
        for _ in 0..100 {
            if emitter.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(TurnOutput::reply("late"))
    };
    let coordinator = ExecutionCoordinator::builder(runner)
        .limits(CoordinatorLimits {
            max_workers: 2,
            stream_idle_timeout: Duration::from_millis(50),
        })
        .build();

    let mut stream = coordinator.stream("s1", "go");
    assert!(matches!(
        stream.next_event().await.unwrap().unwrap(),
        StreamEvent::Delta { .. }
    ));
    let err = stream.next_event().await.unwrap().unwrap_err();
    assert!(matches!(err, coracle::TurnError::StreamTimeout(_)));
    assert!(stream.next_event().await.is_none());
}

// ==================== Checkpoint Scenario ====================

/// Session files survive a coordinator restart via the checkpoint store;
/// reset removes the blob.
#[tokio::test]
async fn test_checkpoint_round_trip_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let runner = |_request: TurnRequest, _emitter: &ChunkEmitter| {
        Ok(TurnOutput {
            reply: "wrote".to_string(),
            updates: vec![coracle::PendingUpdate::upsert(coracle::Record::new(
                "/scratch.txt",
                "kept",
            ))],
        })
    };

    {
        let coordinator = ExecutionCoordinator::builder(runner)
            .checkpointer(Arc::new(JsonCheckpointStore::new(dir.path())))
            .build();
        coordinator.invoke("s1", "go").await.unwrap();
    }

    // A new coordinator restores the merged files on first access.
    let coordinator = ExecutionCoordinator::builder(echo_runner())
        .checkpointer(Arc::new(JsonCheckpointStore::new(dir.path())))
        .build();
    let files = coordinator.session_files("s1").await;
    assert_eq!(files.read().await.get("/scratch.txt").unwrap().content, "kept");
    drop(files);

    // Reset discards state and the blob; a further restart sees nothing.
    coordinator.reset("s1").await;
    let coordinator = ExecutionCoordinator::builder(echo_runner())
        .checkpointer(Arc::new(JsonCheckpointStore::new(dir.path())))
        .build();
    let files = coordinator.session_files("s1").await;
    assert!(files.read().await.is_empty());
}

// ==================== Capability Scenario ====================

#[tokio::test]
async fn test_execute_surfaces_unsupported_operation() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = ExecutionCoordinator::new(echo_runner());
    let router = session_router(&coordinator, "s1", &store).await;

    assert!(
        !router
            .capabilities("/memories/x")
            .contains(&coracle::Capability::Execute)
    );
    let err = router.execute("rm -rf /").await.unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { op: "execute" }));
}

// ==================== Glob Scenario ====================

#[tokio::test]
async fn test_glob_matches_across_router() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = ExecutionCoordinator::new(echo_runner());
    let router = session_router(&coordinator, "s1", &store).await;

    router.write("/memories/a.md", "x").await.unwrap();
    router.write("/memories/b.md", "x").await.unwrap();
    router.write("/memories/c.txt", "x").await.unwrap();

    let matched = router.glob("/memories/*.md").await.unwrap();
    assert_eq!(matched, vec!["/memories/a.md", "/memories/b.md"]);
}
