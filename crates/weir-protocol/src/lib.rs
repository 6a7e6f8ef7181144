pub mod paths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a session.
pub type SessionId = String;

/// Events produced for a single session. The session id is never carried on
/// the event itself: it is implicit in the stream the event is appended to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart,
    TextDelta {
        text: String,
    },
    ToolUseStart {
        tool_name: String,
        tool_id: String,
    },
    ToolUseDelta {
        tool_id: String,
        partial_json: String,
    },
    ToolUseEnd {
        tool_id: String,
    },
    MessageComplete {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },
    Error {
        error: String,
    },
    SessionEnd {
        exit_code: Option<i32>,
    },
}

/// A tool invocation observed during a turn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_id: String,
}

/// An event as stored in a stream. The offset is assigned by the event log
/// at append time and is the resumable cursor for reconnecting clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub offset: u64,
    pub timestamp_ms: u64,
    pub event: SessionEvent,
}

/// Result of a snapshot read. `next_offset` is where a live subscription
/// must begin to continue without gaps or duplicates.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamSnapshot {
    pub events: Vec<StreamEntry>,
    pub next_offset: u64,
}

/// A user currently present in a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceUser {
    pub user_id: String,
    pub name: String,
}

/// Who is viewing and who is actively typing in a session.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PresenceSnapshot {
    pub viewers: Vec<PresenceUser>,
    pub typing_users: Vec<PresenceUser>,
}

/// Append bodies accept a single event or an array of events.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum EventBody {
    One(SessionEvent),
    Many(Vec<SessionEvent>),
}

impl EventBody {
    pub fn into_vec(self) -> Vec<SessionEvent> {
        match self {
            EventBody::One(event) => vec![event],
            EventBody::Many(events) => events,
        }
    }
}

/// Client-to-server requests sent as JSON-lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Streams
    StreamCreate {
        session_id: SessionId,
    },
    StreamAppend {
        session_id: SessionId,
        events: EventBody,
    },
    StreamRead {
        session_id: SessionId,
        #[serde(default)]
        from_offset: u64,
        #[serde(default)]
        live: bool,
    },
    StreamDelete {
        session_id: SessionId,
    },

    // Presence
    PresenceUpdate {
        session_id: SessionId,
        user_id: String,
        name: String,
        #[serde(default)]
        is_typing: bool,
    },
    PresenceGet {
        session_id: SessionId,
    },
    TypingSet {
        session_id: SessionId,
        user_id: String,
        is_typing: bool,
    },
    PresenceLeave {
        session_id: SessionId,
        user_id: String,
    },

    // Sessions
    SessionStart {
        session_id: SessionId,
        cwd: PathBuf,
        #[serde(default)]
        resume_token: Option<String>,
    },
    SessionSend {
        session_id: SessionId,
        content: String,
    },
    SessionInterrupt {
        session_id: SessionId,
    },
    SessionStop {
        session_id: SessionId,
    },
    SessionList,
}

/// Server-to-client responses. `Entry` frames deliver stream entries (each
/// carrying its offset); `Heartbeat` frames only prove the transport is
/// alive and never consume an offset.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Entry {
        entry: StreamEntry,
    },
    Heartbeat {
        timestamp_ms: u64,
    },
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    StreamNotFound,
    SessionNotFound,
    InvalidRequest,
    ServerError,
}
