//! Streaming bridge between a blocking turn computation and an async
//! consumer.
//!
//! The bridge is an explicit producer / ordered channel / consumer model:
//! the worker thread pushes [`StreamEvent`]s through a [`ChunkEmitter`] in
//! production order, and the network-facing side drains a [`TurnStream`]
//! with an idle timeout. A terminal `final` or `error` event marks
//! completion. Cancellation is cooperative: dropping the stream sets a flag
//! that the producer checks between chunks.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use super::TurnError;

/// One event in a streamed turn.
///
/// `delta` carries assistant text; `progress` carries non-text status
/// updates (tool activity and the like); `final` and `error` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta {
        /// The text fragment.
        text: String,
    },
    /// Non-text status update emitted during execution.
    Progress {
        /// Human-readable status message.
        message: String,
    },
    /// Terminal event: the complete final response.
    Final {
        /// The full assistant reply.
        text: String,
    },
    /// Terminal event: the turn failed.
    Error {
        /// Error description.
        detail: String,
    },
}

impl StreamEvent {
    /// Whether this event completes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }
}

/// Producer handle for pushing stream events from a turn computation.
///
/// Events are delivered to the consumer in the exact order they are
/// emitted (single-producer FIFO channel, no reordering). The emit methods
/// return `false` once the consumer has gone away or cancelled, so
/// producers can stop at the next chunk boundary; an in-flight computation
/// step is not preempted.
#[derive(Clone)]
pub struct ChunkEmitter {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for ChunkEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkEmitter")
            .field("streaming", &self.tx.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ChunkEmitter {
    /// Create a connected emitter/stream pair.
    pub(crate) fn channel(idle_timeout: Duration) -> (Self, TurnStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let emitter = Self {
            tx: Some(tx),
            cancelled: Arc::clone(&cancelled),
        };
        let stream = TurnStream {
            rx,
            cancelled,
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            finished: false,
        };
        (emitter, stream)
    }

    /// Create a discarding emitter for non-streaming turns.
    pub(crate) fn sink() -> Self {
        Self {
            tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit incremental assistant text. Returns `false` if the consumer is
    /// gone and the producer should stop.
    pub fn delta(&self, text: impl Into<String>) -> bool {
        self.send(StreamEvent::Delta { text: text.into() })
    }

    /// Emit a non-text progress update. Returns `false` if the consumer is
    /// gone and the producer should stop.
    pub fn progress(&self, message: impl Into<String>) -> bool {
        self.send(StreamEvent::Progress {
            message: message.into(),
        })
    }

    /// Whether the consumer has requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Send the completion sentinel. Delivery is best-effort: the consumer
    /// may already be gone.
    pub(crate) fn finish(&self, text: String) {
        self.send_terminal(StreamEvent::Final { text });
    }

    /// Send the error sentinel. Delivery is best-effort.
    pub(crate) fn fail(&self, detail: String) {
        self.send_terminal(StreamEvent::Error { detail });
    }

    fn send(&self, event: StreamEvent) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match &self.tx {
            Some(tx) => tx.send(event).is_ok(),
            // Non-streaming turns discard chunks without signalling a stop.
            None => true,
        }
    }

    fn send_terminal(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Consumer side of a streamed turn.
///
/// Yields events in production order and terminates after a `final` or
/// `error` sentinel. If no event arrives within the configured idle
/// window, the stream yields [`TurnError::StreamTimeout`] and terminates,
/// setting the cancellation flag so the worker winds down cooperatively.
/// Dropping the stream also sets the flag (client disconnection).
pub struct TurnStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancelled: Arc<AtomicBool>,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    finished: bool,
}

impl fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnStream")
            .field("idle_timeout", &self.idle_timeout)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl TurnStream {
    /// Receive the next event, or `None` once the stream has terminated.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, TurnError>> {
        futures::StreamExt::next(self).await
    }

    /// Drain the stream, concatenating delta text, and return the final
    /// reply (preferring the `final` sentinel's text).
    pub async fn collect_reply(&mut self) -> Result<String, TurnError> {
        let mut deltas = String::new();
        while let Some(event) = self.next_event().await {
            match event? {
                StreamEvent::Delta { text } => deltas.push_str(&text),
                StreamEvent::Progress { .. } => {}
                StreamEvent::Final { text } => return Ok(text),
                StreamEvent::Error { detail } => return Err(TurnError::Execution(detail)),
            }
        }
        Ok(deltas)
    }
}

impl Stream for TurnStream {
    type Item = Result<StreamEvent, TurnError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let next_deadline = Instant::now() + this.idle_timeout;
                this.deadline.as_mut().reset(next_deadline);
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(None) => {
                // Producer went away without a sentinel.
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.finished = true;
                    this.cancelled.store(true, Ordering::SeqCst);
                    Poll::Ready(Some(Err(TurnError::StreamTimeout(this.idle_timeout))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
