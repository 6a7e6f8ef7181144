use std::collections::HashMap;
use std::time::SystemTime;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use weir_protocol::{SessionEvent, SessionId, StreamEntry, StreamSnapshot};

use crate::error::WeirError;

/// A single session's append-only event sequence. Offsets are assigned here
/// and nowhere else; `next_offset` always equals `entries.len()`.
struct StreamState {
    entries: Vec<StreamEntry>,
    next_offset: u64,
    created_at_ms: u64,
    updated_at_ms: u64,
}

struct LiveSubscriber {
    id: u64,
    tx: mpsc::UnboundedSender<StreamEntry>,
}

#[derive(Default)]
struct LogInner {
    streams: HashMap<SessionId, StreamState>,
    subscribers: HashMap<SessionId, Vec<LiveSubscriber>>,
    next_subscriber_id: u64,
}

/// Stream metadata returned by `create_stream`.
#[derive(Debug, Clone, Copy)]
pub struct StreamMeta {
    pub next_offset: u64,
    pub created_at_ms: u64,
}

/// A live subscription to one session's stream. Entries arrive in offset
/// order, one per append. Dropping the subscription unsubscribes lazily:
/// the log prunes the dead sender on the next append.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEntry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next live entry. Returns `None` once the stream is
    /// deleted or the subscription is removed.
    pub async fn recv(&mut self) -> Option<StreamEntry> {
        self.rx.recv().await
    }
}

/// The single source of truth for what happened in each session, in what
/// order. In-memory only: not durable across a server restart.
pub struct EventLog {
    inner: Mutex<LogInner>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// Create a stream for a session. Idempotent: an existing stream is
    /// returned unchanged, offsets are never reset.
    pub async fn create_stream(&self, session_id: &str) -> StreamMeta {
        let mut inner = self.inner.lock().await;
        let now = epoch_ms();
        let stream = inner
            .streams
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id = %session_id, "stream created");
                StreamState {
                    entries: Vec::new(),
                    next_offset: 0,
                    created_at_ms: now,
                    updated_at_ms: now,
                }
            });
        StreamMeta {
            next_offset: stream.next_offset,
            created_at_ms: stream.created_at_ms,
        }
    }

    /// Append one event. Offset assignment and subscriber fan-out happen in
    /// the same atomic step, so live delivery order always matches a later
    /// snapshot read.
    pub async fn append(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<StreamEntry, WeirError> {
        let mut inner = self.inner.lock().await;
        append_locked(&mut inner, session_id, event)
    }

    /// Append a batch under one lock acquisition. Events from other
    /// sessions may interleave between batches, never within one.
    pub async fn append_batch(
        &self,
        session_id: &str,
        events: Vec<SessionEvent>,
    ) -> Result<Vec<StreamEntry>, WeirError> {
        let mut inner = self.inner.lock().await;
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            appended.push(append_locked(&mut inner, session_id, event)?);
        }
        Ok(appended)
    }

    /// Snapshot read: every stored entry with `offset >= from_offset`, plus
    /// the stream's current `next_offset`.
    pub async fn snapshot(
        &self,
        session_id: &str,
        from_offset: u64,
    ) -> Result<StreamSnapshot, WeirError> {
        let inner = self.inner.lock().await;
        let stream = inner
            .streams
            .get(session_id)
            .ok_or_else(|| WeirError::StreamNotFound(session_id.to_string()))?;

        let events = stream
            .entries
            .iter()
            .filter(|e| e.offset >= from_offset)
            .cloned()
            .collect();
        Ok(StreamSnapshot {
            events,
            next_offset: stream.next_offset,
        })
    }

    /// Replay from `from_offset` and register a live subscriber under one
    /// lock acquisition: nothing appended between the replay and the
    /// registration can be skipped or duplicated.
    pub async fn subscribe(
        &self,
        session_id: &str,
        from_offset: u64,
    ) -> Result<(Vec<StreamEntry>, Subscription), WeirError> {
        let mut inner = self.inner.lock().await;
        let stream = inner
            .streams
            .get(session_id)
            .ok_or_else(|| WeirError::StreamNotFound(session_id.to_string()))?;

        let replay: Vec<StreamEntry> = stream
            .entries
            .iter()
            .filter(|e| e.offset >= from_offset)
            .cloned()
            .collect();

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(LiveSubscriber { id, tx });

        Ok((replay, Subscription { id, rx }))
    }

    /// Remove a live subscriber. Idempotent; an emptied subscriber set is
    /// dropped entirely to bound memory.
    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let mut inner = self.inner.lock().await;
        let emptied = match inner.subscribers.get_mut(session_id) {
            Some(subs) => {
                subs.retain(|s| s.id != subscriber_id);
                subs.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.subscribers.remove(session_id);
        }
    }

    /// Delete a stream and drop its subscriber set; live subscriptions end.
    /// Returns true iff a stream existed.
    pub async fn delete_stream(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let existed = inner.streams.remove(session_id).is_some();
        inner.subscribers.remove(session_id);
        if existed {
            info!(session_id = %session_id, "stream deleted");
        }
        existed
    }

    /// Whether a stream exists for the session.
    pub async fn stream_exists(&self, session_id: &str) -> bool {
        self.inner.lock().await.streams.contains_key(session_id)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn append_locked(
    inner: &mut LogInner,
    session_id: &str,
    event: SessionEvent,
) -> Result<StreamEntry, WeirError> {
    let stream = inner
        .streams
        .get_mut(session_id)
        .ok_or_else(|| WeirError::StreamNotFound(session_id.to_string()))?;

    let entry = StreamEntry {
        offset: stream.next_offset,
        timestamp_ms: epoch_ms(),
        event,
    };
    stream.entries.push(entry.clone());
    stream.next_offset += 1;
    stream.updated_at_ms = entry.timestamp_ms;

    // Fan out to live subscribers in registration order. A subscriber whose
    // receiver is gone is pruned here rather than crashing the append path.
    let emptied = match inner.subscribers.get_mut(session_id) {
        Some(subs) => {
            subs.retain(|s| {
                if s.tx.send(entry.clone()).is_ok() {
                    true
                } else {
                    debug!(session_id = %session_id, subscriber_id = s.id, "dropping dead subscriber");
                    false
                }
            });
            subs.is_empty()
        }
        None => false,
    };
    if emptied {
        inner.subscribers.remove(session_id);
    }

    Ok(entry)
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
