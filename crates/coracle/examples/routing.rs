//! Path routing example.
//!
//! Demonstrates longest-prefix routing between a durable `/memories/`
//! backend and an ephemeral default, and that only the durable route
//! survives a "restart" (a freshly constructed session over the same
//! store).
//!
//! Run with: cargo run -p coracle --example routing

use std::sync::Arc;

use coracle::{
    Backend, ChunkEmitter, CompositeRouter, EphemeralBackend, ExecutionCoordinator, MemoryStore,
    Namespace, PersistentBackend, TurnOutput, TurnRequest,
};

fn echo(request: TurnRequest, _emitter: &ChunkEmitter) -> Result<TurnOutput, coracle::TurnError> {
    Ok(TurnOutput::reply(request.input))
}

async fn build_router(
    coordinator: &ExecutionCoordinator,
    session_id: &str,
    store: &Arc<MemoryStore>,
) -> Result<CompositeRouter, coracle::BackendError> {
    let files = coordinator.session_files(session_id).await;
    let ephemeral: Arc<dyn Backend> = Arc::new(EphemeralBackend::new(files));
    let memories: Arc<dyn Backend> = Arc::new(PersistentBackend::new(
        Arc::clone(store) as _,
        Namespace::new(["demo-agent", "memories"]),
    ));
    Ok(CompositeRouter::builder(ephemeral)
        .route("/memories/", memories)?
        .build())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());

    println!("=== First session ===");
    {
        let coordinator = ExecutionCoordinator::new(echo);
        let router = build_router(&coordinator, "s1", &store).await?;

        // Durable route: applied immediately, no pending update.
        router.write("/memories/notes.md", "ship the prototype").await?;

        // Default route: the ephemeral backend proposes an update which
        // the session owner merges.
        let result = router.write("/scratch.txt", "temporary working notes").await?;
        if let Some(update) = result.pending {
            let files = coordinator.session_files("s1").await;
            files.write().await.apply(update);
        }

        println!("memories: {:?}", router.list("/memories/").await?);
        println!("scratch:  {:?}", router.read("/scratch.txt").await?.content);
    }

    println!("\n=== After restart (same store, fresh session) ===");
    let coordinator = ExecutionCoordinator::new(echo);
    let router = build_router(&coordinator, "s1", &store).await?;

    println!(
        "memories/notes.md: {:?}",
        router.read("/memories/notes.md").await?.content
    );
    match router.read("/scratch.txt").await {
        Err(err) => println!("scratch.txt: {err}"),
        Ok(_) => println!("scratch.txt unexpectedly survived"),
    }

    Ok(())
}
