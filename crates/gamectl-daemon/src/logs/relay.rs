//! Cancellable producer task forwarding container logs over a bounded
//! channel.
//!
//! The channel is the only buffer between the engine and the consumer. When
//! it is full the producer waits, which in turn stops reading from the
//! engine: a slow consumer slows the relay down, it never loses lines and
//! never grows memory without bound.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{ContainerEngine, ContainerRef, EngineError, LogStream};

/// Default capacity of the per-subscription channel.
pub const DEFAULT_LOG_BUFFER: usize = 256;

/// One non-empty log line stamped with the time the relay received it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    Line(LogLine),
    /// Terminal: the engine stream failed. Nothing follows.
    Error { message: String },
}

/// Consumer side of a relay.
///
/// Dropping it (or calling [`close`](Self::close)) cancels the producer,
/// which drops the engine log stream.
pub struct LogSubscription {
    rx: mpsc::Receiver<LogEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LogSubscription {
    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    /// Stop relaying and wait for the producer to let go of the engine
    /// stream.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Log relay task failed");
        }
    }

    /// Whether the producer has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Attaches [`LogSubscription`]s to container log streams.
#[derive(Debug, Clone, Copy)]
pub struct LogRelay {
    capacity: usize,
}

impl Default for LogRelay {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER)
    }
}

impl LogRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// Open the container's log stream and start relaying it.
    ///
    /// Fails without spawning anything if the engine cannot open the stream.
    pub async fn attach(
        &self,
        engine: &Arc<dyn ContainerEngine>,
        container: &ContainerRef,
    ) -> Result<LogSubscription, EngineError> {
        let stream = engine.stream_logs(container).await?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(stream, tx, cancel.clone(), container.clone()));
        debug!(container = %container.short(), "Log relay attached");
        Ok(LogSubscription { rx, cancel, task })
    }
}

/// Split a raw chunk into trimmed, non-empty lines.
pub fn split_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// Send `event` unless cancelled first. Returns false when the relay should
/// stop.
async fn deliver(
    tx: &mpsc::Sender<LogEvent>,
    cancel: &CancellationToken,
    event: LogEvent,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

async fn pump(
    mut stream: LogStream,
    tx: mpsc::Sender<LogEvent>,
    cancel: CancellationToken,
    container: ContainerRef,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let timestamp = Utc::now();
                for line in split_lines(&chunk) {
                    let event = LogEvent::Line(LogLine {
                        message: line.to_string(),
                        timestamp,
                    });
                    if !deliver(&tx, &cancel, event).await {
                        debug!(container = %container.short(), "Log consumer went away");
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(container = %container.short(), error = %e, "Log stream failed");
                deliver(
                    &tx,
                    &cancel,
                    LogEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                break;
            }
            None => break,
        }
    }
    debug!(container = %container.short(), "Log relay finished");
}
