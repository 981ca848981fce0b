//! Streaming turn example.
//!
//! Demonstrates the producer / ordered channel / consumer bridge: the
//! blocking runner pushes chunks through the emitter while the async
//! consumer drains the stream until the completion sentinel.
//!
//! Run with: cargo run -p coracle --example streaming

use std::time::Duration;

use coracle::{ChunkEmitter, ExecutionCoordinator, StreamEvent, TurnOutput, TurnRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = ExecutionCoordinator::new(
        |request: TurnRequest, emitter: &ChunkEmitter| {
            emitter.progress("thinking...");
            let mut reply = String::new();
            for word in request.input.split_whitespace() {
                // Cooperative cancellation: stop at the next chunk
                // boundary if the consumer disconnected.
                if !emitter.delta(format!("{word} ")) {
                    break;
                }
                reply.push_str(word);
                reply.push(' ');
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(TurnOutput::reply(reply.trim_end().to_string()))
        },
    );

    let mut stream = coordinator.stream("demo", "the quick brown fox jumps over the lazy dog");
    while let Some(event) = stream.next_event().await {
        match event? {
            StreamEvent::Delta { text } => print!("{text}"),
            StreamEvent::Progress { message } => println!("[{message}]"),
            StreamEvent::Final { text } => {
                println!("\n\nfinal reply: {text}");
            }
            StreamEvent::Error { detail } => {
                eprintln!("turn failed: {detail}");
            }
        }
    }

    Ok(())
}
