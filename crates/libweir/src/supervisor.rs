use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use weir_protocol::{SessionEvent, SessionId, ToolCall};

use crate::batch::{BatchQueue, EventSink};
use crate::error::WeirError;
use crate::records::{RawContentBlock, RawDelta, RawRecord, tool_id_from_index};

/// How the agent subprocess is launched.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub base_args: Vec<String>,
    /// Flag passed with a resume token to continue a prior conversation.
    pub resume_flag: String,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            resume_flag: "--resume".to_string(),
        }
    }
}

/// Per-session bookkeeping while the subprocess runs. The turn accumulators
/// are reset on every outgoing message and drained on completion.
struct ActiveSession {
    pid: Option<i32>,
    input_tx: mpsc::UnboundedSender<String>,
    accumulated: String,
    tool_calls: Vec<ToolCall>,
    /// Tool invocation ids started but not yet ended; force-closed on exit.
    open_tools: Vec<String>,
    resume_token: Option<String>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    stream_enabled: bool,
}

/// Owns the session id -> running subprocess table, translates raw process
/// output into session events, and drives lifecycle transitions. Events go
/// synchronously to local listeners and, when a durable stream was
/// provisioned, through the batching queue into the event log.
pub struct Supervisor {
    config: SupervisorConfig,
    sink: Arc<dyn EventSink>,
    queue: BatchQueue,
    sessions: Mutex<HashMap<SessionId, ActiveSession>>,
    listeners: Mutex<HashMap<SessionId, Vec<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            queue: BatchQueue::new(Arc::clone(&sink)),
            sink,
            sessions: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session, spawning the agent subprocess. A duplicate start for
    /// a running session is an idempotent no-op; spawn failures are reported
    /// as a local `error` event, never raised to the caller.
    pub async fn start(self: Arc<Self>, session_id: &str, cwd: &Path, resume_token: Option<String>) {
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(session_id) {
                warn!(session_id = %session_id, "session already running, ignoring duplicate start");
                return;
            }
        }

        // Provision the durable stream before any event can be queued.
        // Failure downgrades to local-only delivery rather than aborting.
        let stream_enabled = match self.sink.provision(session_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "stream provisioning failed, continuing without durable streaming"
                );
                false
            }
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.base_args);
        if let Some(token) = resume_token.as_deref() {
            cmd.arg(&self.config.resume_flag).arg(token);
        }
        cmd.current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            session_id = %session_id,
            program = %self.config.program.display(),
            cwd = %cwd.display(),
            resuming = resume_token.is_some(),
            "starting session"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to spawn agent");
                self.emit_local(
                    session_id,
                    &SessionEvent::Error {
                        error: format!("failed to spawn agent: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        let pid = child.id().map(|p| p as i32);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Writer task: lines in, record-separated writes out.
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(line) = input_rx.recv().await {
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin.write_all(b"\n").await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        let session = ActiveSession {
            pid,
            input_tx,
            accumulated: String::new(),
            tool_calls: Vec::new(),
            open_tools: Vec::new(),
            resume_token,
            input_tokens: None,
            output_tokens: None,
            stream_enabled,
        };
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), session);

        self.emit_event(session_id, SessionEvent::SessionStart, stream_enabled)
            .await;

        // Stderr is diagnostics, never events.
        if let Some(stderr) = stderr {
            let sid = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id = %sid, line = %line, "agent stderr");
                }
            });
        }

        // One task per session: drain stdout to EOF so no trailing records
        // are lost, then reap the exit status.
        let sup = Arc::clone(&self);
        let sid = session_id.to_string();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sup.handle_line(&sid, &line).await;
                }
            }
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(session_id = %sid, error = %e, "failed to reap agent process");
                    None
                }
            };
            sup.handle_exit(&sid, exit_code).await;
        });
    }

    /// Send a user message to a running session. Resets the turn
    /// accumulators and writes the content followed by a record separator.
    pub async fn send_message(&self, session_id: &str, content: &str) -> Result<(), WeirError> {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.accumulated.clear();
                session.tool_calls.clear();
                session.open_tools.clear();
                session.input_tokens = None;
                session.output_tokens = None;
                if session.input_tx.send(content.to_string()).is_err() {
                    warn!(session_id = %session_id, "agent stdin closed");
                }
                return Ok(());
            }
        }

        warn!(session_id = %session_id, "session not found for send");
        self.emit_local(
            session_id,
            &SessionEvent::Error {
                error: "Session not found".to_string(),
            },
        )
        .await;
        Err(WeirError::SessionNotFound(session_id.to_string()))
    }

    /// Best-effort interrupt signal. Returns immediately; there is no
    /// acknowledgment contract with the subprocess.
    pub async fn interrupt(&self, session_id: &str) {
        let sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(session) => {
                info!(session_id = %session_id, "interrupting session");
                signal_process(session.pid, libc::SIGINT);
            }
            None => warn!(session_id = %session_id, "session not found for interrupt"),
        }
    }

    /// Forcibly terminate a session and drop its bookkeeping immediately.
    /// The exit waiter finds the session gone later and does nothing.
    pub async fn stop(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(session_id);
        match removed {
            Some(session) => {
                info!(session_id = %session_id, "stopping session");
                signal_process(session.pid, libc::SIGTERM);
                self.queue.close(session_id).await;
                self.listeners.lock().await.remove(session_id);
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn list_active(&self) -> Vec<SessionId> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Register a local in-process listener for a session's events.
    pub async fn subscribe_local(&self, session_id: &str) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn handle_line(&self, session_id: &str, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let record: RawRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(_) => {
                // Frequently benign diagnostic text from the subprocess, not
                // a structured error.
                debug!(session_id = %session_id, line = %trimmed, "non-record output");
                return;
            }
        };
        self.process_record(session_id, record).await;
    }

    async fn process_record(&self, session_id: &str, record: RawRecord) {
        let mut events: Vec<SessionEvent> = Vec::new();
        let stream_enabled;
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            stream_enabled = session.stream_enabled;

            match record {
                RawRecord::ContentBlockDelta {
                    delta: Some(RawDelta::TextDelta { text }),
                    ..
                } => {
                    session.accumulated.push_str(&text);
                    events.push(SessionEvent::TextDelta { text });
                }
                RawRecord::ContentBlockDelta {
                    delta: Some(RawDelta::InputJsonDelta { partial_json }),
                    index,
                } => {
                    events.push(SessionEvent::ToolUseDelta {
                        tool_id: tool_id_from_index(index.as_ref()),
                        partial_json,
                    });
                }
                RawRecord::ContentBlockDelta { .. } => {}
                RawRecord::ContentBlockStart {
                    content_block: Some(RawContentBlock::ToolUse { name, id }),
                } => {
                    let tool_name = name.unwrap_or_else(|| "unknown".to_string());
                    let tool_id = id.unwrap_or_else(|| "unknown".to_string());
                    session.tool_calls.push(ToolCall {
                        tool_name: tool_name.clone(),
                        tool_id: tool_id.clone(),
                    });
                    session.open_tools.push(tool_id.clone());
                    events.push(SessionEvent::ToolUseStart { tool_name, tool_id });
                }
                RawRecord::ContentBlockStart { .. } => {}
                RawRecord::ContentBlockStop { index } => {
                    if let Some(index) = index {
                        let tool_id = tool_id_from_index(Some(&index));
                        session.open_tools.retain(|t| t != &tool_id);
                        events.push(SessionEvent::ToolUseEnd { tool_id });
                    }
                }
                RawRecord::MessageDelta { usage } => {
                    if let Some(usage) = usage {
                        if usage.input_tokens.is_some() {
                            session.input_tokens = usage.input_tokens;
                        }
                        if usage.output_tokens.is_some() {
                            session.output_tokens = usage.output_tokens;
                        }
                    }
                }
                RawRecord::MessageStop => {
                    events.push(complete_turn(session));
                }
                RawRecord::SessionId { session_id: token } => {
                    if let Some(token) = token {
                        debug!(session_id = %session_id, "agent issued resume token");
                        session.resume_token = Some(token);
                    }
                }
                RawRecord::Error { error } => {
                    let message = error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "Unknown error".to_string());
                    events.push(SessionEvent::Error { error: message });
                }
                RawRecord::Unknown => {
                    debug!(session_id = %session_id, "unrecognized record kind");
                }
            }
        }

        for event in events {
            self.emit_event(session_id, event, stream_enabled).await;
        }
    }

    async fn handle_exit(&self, session_id: &str, exit_code: Option<i32>) {
        let removed = self.sessions.lock().await.remove(session_id);
        let Some(mut session) = removed else {
            // An explicit stop got here first; nothing left to report.
            debug!(session_id = %session_id, "exit for a session already removed");
            return;
        };
        info!(session_id = %session_id, exit_code = ?exit_code, "session exited");

        let mut events = Vec::new();
        // Close out any tool invocation the process abandoned mid-call.
        for tool_id in std::mem::take(&mut session.open_tools) {
            events.push(SessionEvent::ToolUseEnd { tool_id });
        }
        // A partial turn is never silently dropped.
        if !session.accumulated.is_empty() {
            events.push(complete_turn(&mut session));
        }
        events.push(SessionEvent::SessionEnd { exit_code });

        for event in events {
            self.emit_event(session_id, event, session.stream_enabled)
                .await;
        }

        // Final forced flush of anything still buffered for this session,
        // then drop the local listener set.
        self.queue.close(session_id).await;
        self.listeners.lock().await.remove(session_id);
    }

    async fn emit_event(&self, session_id: &str, event: SessionEvent, stream_enabled: bool) {
        self.emit_local(session_id, &event).await;
        if stream_enabled {
            self.queue.enqueue(session_id, event).await;
        }
    }

    async fn emit_local(&self, session_id: &str, event: &SessionEvent) {
        let mut listeners = self.listeners.lock().await;
        let emptied = match listeners.get_mut(session_id) {
            Some(subs) => {
                subs.retain(|tx| tx.send(event.clone()).is_ok());
                subs.is_empty()
            }
            None => false,
        };
        if emptied {
            listeners.remove(session_id);
        }
    }
}

/// Drain the turn accumulators into a completion event.
fn complete_turn(session: &mut ActiveSession) -> SessionEvent {
    let event = SessionEvent::MessageComplete {
        content: std::mem::take(&mut session.accumulated),
        tool_calls: std::mem::take(&mut session.tool_calls),
        input_tokens: session.input_tokens.take(),
        output_tokens: session.output_tokens.take(),
        resume_token: session.resume_token.clone(),
    };
    session.open_tools.clear();
    event
}

fn signal_process(pid: Option<i32>, signal: i32) {
    if let Some(pid) = pid.filter(|p| *p > 0) {
        // SAFETY: kill() with a valid pid and signal number has no memory
        // preconditions; the pid stays ours until wait() reaps it.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}
