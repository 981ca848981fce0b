//! Coracle CLI - Test harness for the storage and coordination core
//!
//! Usage:
//!   coracle <session-id> "message"    Run one streamed turn
//!   coracle <session-id>              Read the message from stdin
//!   coracle --reset <session-id>      Discard a session's ephemeral state
//!
//! State (persistent store + session checkpoints) lives under
//! `CORACLE_STATE_DIR` (default `./.coracle`). The built-in runner echoes
//! the message back word by word and records a transcript file in the
//! session's ephemeral state. Messages starting with `remember:` are also
//! written under `/memories/`, which routes to the durable store and
//! survives across runs; plain transcripts do not.

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use coracle::{
    Backend, ChunkEmitter, CompositeRouter, EphemeralBackend, ExecutionCoordinator,
    JsonCheckpointStore, JsonFileStore, Namespace, PendingUpdate, PersistentBackend, Record,
    StreamEvent, TurnOutput, TurnRequest,
};

/// Echo runner: streams the input back word by word and proposes a
/// transcript record for the session's ephemeral state.
fn echo_turn(
    request: TurnRequest,
    emitter: &ChunkEmitter,
) -> Result<TurnOutput, coracle::TurnError> {
    let mut reply = String::new();
    for word in request.input.split_whitespace() {
        if emitter.is_cancelled() {
            break;
        }
        if !reply.is_empty() {
            reply.push(' ');
        }
        reply.push_str(word);
        emitter.delta(format!("{word} "));
    }

    let transcript = Record::new(
        format!("/transcript/turn-{:04}.txt", request.turn),
        format!("U> {}\nA> {reply}\n", request.input),
    );
    Ok(TurnOutput {
        reply,
        updates: vec![PendingUpdate::upsert(transcript)],
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let state_dir = std::env::var("CORACLE_STATE_DIR").unwrap_or_else(|_| ".coracle".to_string());
    let state_dir = std::path::PathBuf::from(state_dir);

    let coordinator = ExecutionCoordinator::builder(echo_turn)
        .checkpointer(Arc::new(JsonCheckpointStore::new(
            state_dir.join("checkpoints"),
        )))
        .build();

    if args.len() >= 3 && args[1] == "--reset" {
        coordinator.reset(&args[2]).await;
        println!("reset session {}", args[2]);
        return Ok(());
    }

    let (session_id, message) = match args.len() {
        n if n >= 3 => (args[1].clone(), args[2].clone()),
        2 => {
            let mut message = String::new();
            std::io::stdin()
                .read_to_string(&mut message)
                .context("failed to read stdin")?;
            (args[1].clone(), message.trim().to_string())
        }
        _ => {
            eprintln!("usage: coracle <session-id> [message]");
            eprintln!("       coracle --reset <session-id>");
            std::process::exit(2);
        }
    };

    // Per-session backend graph: /memories/ durable, everything else
    // ephemeral to this session.
    let store = Arc::new(
        JsonFileStore::open(state_dir.join("store.json"))
            .await
            .context("failed to open durable store")?,
    );
    let files = coordinator.session_files(&session_id).await;
    let ephemeral: Arc<dyn Backend> = Arc::new(EphemeralBackend::new(files));
    let memories: Arc<dyn Backend> = Arc::new(PersistentBackend::new(
        store,
        Namespace::new([session_id.as_str(), "memories"]),
    ));
    let router = CompositeRouter::builder(ephemeral)
        .route("/memories/", memories)
        .map_err(|e| anyhow::anyhow!("bad route: {e}"))?
        .build();

    let mut stream = coordinator.stream(&session_id, message.clone());
    while let Some(event) = stream.next_event().await {
        match event.map_err(|e| anyhow::anyhow!("stream failed: {e}"))? {
            StreamEvent::Delta { text } => print!("{text}"),
            StreamEvent::Progress { message } => eprintln!("[{message}]"),
            StreamEvent::Final { .. } => println!(),
            StreamEvent::Error { detail } => {
                eprintln!("coracle: turn failed: {detail}");
                std::process::exit(1);
            }
        }
    }

    // `remember:` messages are written through the durable route.
    if let Some(note) = message.strip_prefix("remember:") {
        let existing = router
            .list("/memories/")
            .await
            .map_err(|e| anyhow::anyhow!("list failed: {e}"))?;
        let path = format!("/memories/note-{:03}.md", existing.len());
        router
            .write(&path, note.trim())
            .await
            .map_err(|e| anyhow::anyhow!("write failed: {e}"))?;
        eprintln!("[stored {path}]");
    }

    let memories = router
        .list("/memories/")
        .await
        .map_err(|e| anyhow::anyhow!("list failed: {e}"))?;
    let transcripts = router
        .list("/transcript/")
        .await
        .map_err(|e| anyhow::anyhow!("list failed: {e}"))?;
    eprintln!(
        "[{} memory file(s), {} transcript file(s)]",
        memories.len(),
        transcripts.len()
    );

    Ok(())
}
