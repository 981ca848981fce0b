//! Basic turn execution example.
//!
//! Demonstrates creating a coordinator around a blocking turn runner,
//! invoking serialized turns, and how pending updates from a turn become
//! visible session state.
//!
//! Run with: cargo run -p coracle --example basic

use coracle::{
    ChunkEmitter, ExecutionCoordinator, PendingUpdate, Record, TurnOutput, TurnRequest,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The runner stands in for the opaque (and possibly blocking) model
    // invocation. It returns a reply plus proposed session-state updates.
    let coordinator = ExecutionCoordinator::new(
        |request: TurnRequest, _emitter: &ChunkEmitter| {
            let reply = format!("You said: {}", request.input);
            let transcript = Record::new(
                format!("/transcript/turn-{:04}.txt", request.turn),
                format!("U> {}\nA> {reply}\n", request.input),
            );
            Ok(TurnOutput {
                reply,
                updates: vec![PendingUpdate::upsert(transcript)],
            })
        },
    );

    println!("=== First turn ===");
    let output = coordinator.invoke("demo-session", "hello coracle").await?;
    println!("reply: {}", output.reply);

    println!("\n=== Second turn ===");
    let output = coordinator.invoke("demo-session", "how are you?").await?;
    println!("reply: {}", output.reply);

    // The coordinator merged each turn's pending updates into the
    // session's file mapping.
    println!("\n=== Session state ===");
    let files = coordinator.session_files("demo-session").await;
    let files = files.read().await;
    for path in files.paths_with_prefix("/transcript/") {
        let record = files.get(&path).ok_or("missing record")?;
        println!("{path}:\n{}", record.content);
    }

    Ok(())
}
