use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use weir_protocol::{PresenceSnapshot, PresenceUser, SessionId};

/// How long a viewer survives without a heartbeat.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a typing flag stays believable. Shorter than the presence
/// timeout: a silent user stops "typing" before they stop "viewing".
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(5);

struct PresenceRecord {
    name: String,
    is_typing: bool,
    last_seen: Instant,
}

/// Ephemeral per-session viewer and typing state, independent of the
/// durable event log. Stale records are evicted opportunistically on every
/// update or query; empty session buckets are dropped entirely.
pub struct PresenceTracker {
    sessions: Mutex<HashMap<SessionId, HashMap<String, PresenceRecord>>>,
    presence_timeout: Duration,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_timeouts(PRESENCE_TIMEOUT, TYPING_TIMEOUT)
    }

    pub fn with_timeouts(presence_timeout: Duration, typing_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            presence_timeout,
            typing_timeout,
        }
    }

    /// Upsert a user's presence with a fresh heartbeat.
    pub async fn update(&self, session_id: &str, user_id: &str, name: &str, is_typing: bool) {
        let mut sessions = self.sessions.lock().await;
        let users = sessions.entry(session_id.to_string()).or_default();
        users.insert(
            user_id.to_string(),
            PresenceRecord {
                name: name.to_string(),
                is_typing,
                last_seen: Instant::now(),
            },
        );
        Self::evict_stale(&mut sessions, session_id, self.presence_timeout);
    }

    /// Explicit leave.
    pub async fn remove(&self, session_id: &str, user_id: &str) {
        let mut sessions = self.sessions.lock().await;
        let emptied = match sessions.get_mut(session_id) {
            Some(users) => {
                users.remove(user_id);
                users.is_empty()
            }
            None => false,
        };
        if emptied {
            sessions.remove(session_id);
        }
    }

    /// Current viewers plus the subset typing within the typing window. An
    /// unknown session is simply empty, not an error.
    pub async fn get(&self, session_id: &str) -> PresenceSnapshot {
        let mut sessions = self.sessions.lock().await;
        Self::evict_stale(&mut sessions, session_id, self.presence_timeout);

        let Some(users) = sessions.get(session_id) else {
            return PresenceSnapshot::default();
        };

        let now = Instant::now();
        let mut snapshot = PresenceSnapshot::default();
        for (user_id, record) in users {
            let user = PresenceUser {
                user_id: user_id.clone(),
                name: record.name.clone(),
            };
            if record.is_typing && now.duration_since(record.last_seen) < self.typing_timeout {
                snapshot.typing_users.push(user.clone());
            }
            snapshot.viewers.push(user);
        }
        snapshot
    }

    /// Update the typing flag on an existing record only; typing never
    /// resurrects a departed viewer.
    pub async fn set_typing(&self, session_id: &str, user_id: &str, is_typing: bool) {
        let mut sessions = self.sessions.lock().await;
        if let Some(record) = sessions
            .get_mut(session_id)
            .and_then(|users| users.get_mut(user_id))
        {
            record.is_typing = is_typing;
            record.last_seen = Instant::now();
        }
    }

    fn evict_stale(
        sessions: &mut HashMap<SessionId, HashMap<String, PresenceRecord>>,
        session_id: &str,
        presence_timeout: Duration,
    ) {
        let Some(users) = sessions.get_mut(session_id) else {
            return;
        };
        let now = Instant::now();
        let before = users.len();
        users.retain(|_, record| now.duration_since(record.last_seen) <= presence_timeout);
        if users.len() < before {
            debug!(
                session_id = %session_id,
                evicted = before - users.len(),
                "evicted stale presence records"
            );
        }
        if users.is_empty() {
            sessions.remove(session_id);
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
