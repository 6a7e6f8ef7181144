use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use weir_protocol::{SessionEvent, SessionId};

use crate::log::EventLog;

/// Flush as soon as this many events are buffered.
pub const FLUSH_THRESHOLD: usize = 10;

/// Otherwise flush once this long has passed since the last enqueue.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(50);

/// Destination for flushed batches. Implementations must treat one
/// `deliver` call as a single write: either the whole batch lands or the
/// whole batch is reported failed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Idempotently provision a stream for the session.
    async fn provision(&self, session_id: &str) -> Result<(), SinkError>;

    /// Deliver one batch of events, in order.
    async fn deliver(&self, session_id: &str, batch: &[SessionEvent]) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
#[error("sink delivery failed: {0}")]
pub struct SinkError(pub String);

/// In-process sink appending straight into the event log.
pub struct LogSink {
    log: Arc<EventLog>,
}

impl LogSink {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventSink for LogSink {
    async fn provision(&self, session_id: &str) -> Result<(), SinkError> {
        self.log.create_stream(session_id).await;
        Ok(())
    }

    async fn deliver(&self, session_id: &str, batch: &[SessionEvent]) -> Result<(), SinkError> {
        self.log
            .append_batch(session_id, batch.to_vec())
            .await
            .map(|_| ())
            .map_err(|e| SinkError(e.to_string()))
    }
}

/// Per-session outbound buffer decoupling high-frequency events from write
/// amplification. Each session gets its own flush worker; closing a session
/// tears down its buffer and pending debounce together, after a final
/// forced flush.
pub struct BatchQueue {
    sink: Arc<dyn EventSink>,
    senders: Mutex<HashMap<SessionId, mpsc::UnboundedSender<SessionEvent>>>,
}

impl BatchQueue {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an event for the session, spawning its flush worker on first
    /// use.
    pub async fn enqueue(&self, session_id: &str, event: SessionEvent) {
        let mut senders = self.senders.lock().await;
        let tx = senders.entry(session_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = Arc::clone(&self.sink);
            let id = session_id.to_string();
            tokio::spawn(run_flush_worker(id, rx, sink));
            tx
        });
        if tx.send(event).is_err() {
            // Worker gone; next enqueue will spawn a fresh one.
            senders.remove(session_id);
        }
    }

    /// Tear down the session's queue. The worker performs a final forced
    /// flush of whatever is buffered, regardless of threshold or debounce.
    pub async fn close(&self, session_id: &str) {
        self.senders.lock().await.remove(session_id);
    }
}

async fn run_flush_worker(
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    sink: Arc<dyn EventSink>,
) {
    let mut buffer: Vec<SessionEvent> = Vec::new();
    // Re-armed on every arrival; None while nothing is pending.
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_at = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= FLUSH_THRESHOLD {
                        flush(&session_id, &mut buffer, sink.as_ref()).await;
                        deadline = None;
                    } else {
                        deadline = Some(Instant::now() + FLUSH_DEBOUNCE);
                    }
                }
                None => {
                    flush(&session_id, &mut buffer, sink.as_ref()).await;
                    debug!(session_id = %session_id, "flush worker stopped");
                    break;
                }
            },
            _ = sleep_until(flush_at), if deadline.is_some() => {
                flush(&session_id, &mut buffer, sink.as_ref()).await;
                deadline = None;
            }
        }
    }
}

async fn flush(session_id: &str, buffer: &mut Vec<SessionEvent>, sink: &dyn EventSink) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if let Err(e) = sink.deliver(session_id, &batch).await {
        warn!(session_id = %session_id, error = %e, "batch delivery failed, retrying on next flush");
        // Failed entries must stay ahead of anything enqueued later; new
        // arrivals wait in the channel while a flush is in flight, so
        // restoring the batch keeps the original order.
        *buffer = batch;
    }
}
