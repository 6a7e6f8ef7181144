use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use libweir::{Subscription, WeirError};
use weir_protocol::{ErrorCode, Request, Response};

use crate::server::Shared;

type ClientWriter = Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>;

/// Handle a single client connection: one JSON request per line, one JSON
/// response per line, plus pushed `entry`/`heartbeat` frames for live
/// subscriptions.
pub async fn handle_client(stream: UnixStream, shared: Arc<Shared>) {
    let (reader, writer) = stream.into_split();
    let reader = BufReader::new(reader);
    let writer: ClientWriter = Arc::new(Mutex::new(writer));

    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                error!("read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    code: ErrorCode::InvalidRequest,
                };
                let mut w = writer.lock().await;
                let _ = write_response(&mut w, &resp).await;
                continue;
            }
        };

        let response = handle_request(request, &shared, &writer).await;

        let mut w = writer.lock().await;
        if let Err(e) = write_response(&mut w, &response).await {
            error!("write error: {e}");
            break;
        }
    }
}

async fn handle_request(request: Request, shared: &Arc<Shared>, writer: &ClientWriter) -> Response {
    match request {
        Request::StreamCreate { session_id } => {
            let meta = shared.log.create_stream(&session_id).await;
            ok(serde_json::json!({
                "session_id": session_id,
                "next_offset": meta.next_offset,
                "created_at_ms": meta.created_at_ms,
            }))
        }

        Request::StreamAppend { session_id, events } => {
            let events = events.into_vec();
            match shared.log.append_batch(&session_id, events).await {
                Ok(entries) => ok(serde_json::json!({
                    "appended": entries.len(),
                    "entries": entries,
                })),
                Err(e) => error_response(&e),
            }
        }

        Request::StreamRead {
            session_id,
            from_offset,
            live: false,
        } => match shared.log.snapshot(&session_id, from_offset).await {
            Ok(snapshot) => ok(serde_json::to_value(&snapshot).unwrap_or_default()),
            Err(e) => error_response(&e),
        },

        Request::StreamRead {
            session_id,
            from_offset,
            live: true,
        } => {
            // Replay and registration happen atomically in the log, so no
            // entry appended during the catch-up writes below is skipped
            // or duplicated.
            let (replay, subscription) = match shared.log.subscribe(&session_id, from_offset).await
            {
                Ok(pair) => pair,
                Err(e) => return error_response(&e),
            };

            let replayed = replay.len();
            let mut client_gone = false;
            for entry in replay {
                let frame = Response::Entry { entry };
                let mut w = writer.lock().await;
                if write_response(&mut w, &frame).await.is_err() {
                    debug!(session_id = %session_id, "client left during catch-up");
                    client_gone = true;
                    break;
                }
            }

            if !client_gone {
                let writer = Arc::clone(writer);
                let heartbeat = shared.heartbeat;
                let sid = session_id.clone();
                tokio::spawn(async move {
                    forward_entries(subscription, writer, sid, heartbeat).await;
                });
                info!(session_id = %session_id, from_offset, replayed, "live subscription opened");
            }

            ok(serde_json::json!({ "replayed": replayed }))
        }

        Request::StreamDelete { session_id } => {
            if shared.log.delete_stream(&session_id).await {
                ok(serde_json::json!({ "deleted": true }))
            } else {
                error_response(&WeirError::StreamNotFound(session_id))
            }
        }

        Request::PresenceUpdate {
            session_id,
            user_id,
            name,
            is_typing,
        } => {
            shared
                .presence
                .update(&session_id, &user_id, &name, is_typing)
                .await;
            ok_empty()
        }

        Request::PresenceGet { session_id } => {
            let snapshot = shared.presence.get(&session_id).await;
            ok(serde_json::to_value(&snapshot).unwrap_or_default())
        }

        Request::TypingSet {
            session_id,
            user_id,
            is_typing,
        } => {
            shared
                .presence
                .set_typing(&session_id, &user_id, is_typing)
                .await;
            ok_empty()
        }

        Request::PresenceLeave {
            session_id,
            user_id,
        } => {
            shared.presence.remove(&session_id, &user_id).await;
            ok_empty()
        }

        Request::SessionStart {
            session_id,
            cwd,
            resume_token,
        } => {
            Arc::clone(&shared.supervisor)
                .start(&session_id, &cwd, resume_token)
                .await;
            ok(serde_json::json!({ "session_id": session_id }))
        }

        Request::SessionSend {
            session_id,
            content,
        } => match shared.supervisor.send_message(&session_id, &content).await {
            Ok(()) => ok_empty(),
            Err(e) => error_response(&e),
        },

        Request::SessionInterrupt { session_id } => {
            shared.supervisor.interrupt(&session_id).await;
            ok_empty()
        }

        Request::SessionStop { session_id } => {
            let stopped = shared.supervisor.stop(&session_id).await;
            ok(serde_json::json!({ "stopped": stopped }))
        }

        Request::SessionList => {
            let sessions = shared.supervisor.list_active().await;
            ok(serde_json::json!({ "sessions": sessions }))
        }
    }
}

/// Forward live entries to one subscriber, interleaved with heartbeats. A
/// failed write means the client is gone: the subscription is dropped and
/// the log prunes it on its next append; the append path itself is never
/// affected.
async fn forward_entries(
    mut subscription: Subscription,
    writer: ClientWriter,
    session_id: String,
    heartbeat: Duration,
) {
    let start = tokio::time::Instant::now() + heartbeat;
    let mut ticker = tokio::time::interval_at(start, heartbeat);

    loop {
        tokio::select! {
            entry = subscription.recv() => match entry {
                Some(entry) => {
                    let frame = Response::Entry { entry };
                    let mut w = writer.lock().await;
                    if write_response(&mut w, &frame).await.is_err() {
                        debug!(session_id = %session_id, "subscriber write failed, dropping");
                        break;
                    }
                }
                None => {
                    debug!(session_id = %session_id, "stream closed, ending subscription");
                    break;
                }
            },
            _ = ticker.tick() => {
                let frame = Response::Heartbeat { timestamp_ms: epoch_ms() };
                let mut w = writer.lock().await;
                if write_response(&mut w, &frame).await.is_err() {
                    debug!(session_id = %session_id, "heartbeat write failed, dropping subscriber");
                    break;
                }
            }
        }
    }
}

fn ok(data: serde_json::Value) -> Response {
    Response::Ok { data: Some(data) }
}

fn ok_empty() -> Response {
    Response::Ok { data: None }
}

fn error_response(error: &WeirError) -> Response {
    let (code, message) = error.to_error_code();
    Response::Error { message, code }
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
