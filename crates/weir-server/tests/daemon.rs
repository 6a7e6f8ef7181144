//! End-to-end tests driving the daemon over its Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

use weir_protocol::{ErrorCode, EventBody, Request, Response, SessionEvent, StreamSnapshot};
use weir_server::config::ServerConfig;
use weir_server::server;

struct Client {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("connect to server");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, request: &Request) {
        let json = serde_json::to_string(request).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_frame(&mut self) -> Response {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "server closed connection");
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("bad frame {line:?}: {e}"))
    }

    async fn request(&mut self, request: &Request) -> Response {
        self.send(request).await;
        self.read_frame().await
    }
}

fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        socket_path: dir.join("weir.sock"),
        agent_program: PathBuf::from("/bin/sh"),
        agent_args: Vec::new(),
        resume_flag: "--resume".to_string(),
        heartbeat_secs: 1,
    }
}

async fn start_server(config: ServerConfig) -> PathBuf {
    let path = config.socket_path.clone();
    tokio::spawn(async move {
        let _ = server::run(config).await;
    });
    for _ in 0..100 {
        if UnixStream::connect(&path).await.is_ok() {
            return path;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not start at {}", path.display());
}

fn snapshot_from(response: Response) -> StreamSnapshot {
    match response {
        Response::Ok { data: Some(data) } => serde_json::from_value(data).unwrap(),
        other => panic!("expected ok with data, got {other:?}"),
    }
}

fn text(s: &str) -> SessionEvent {
    SessionEvent::TextDelta {
        text: s.to_string(),
    }
}

#[tokio::test]
async fn stream_crud_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_server(test_config(dir.path())).await;
    let mut client = Client::connect(&path).await;

    let resp = client
        .request(&Request::StreamCreate {
            session_id: "s1".to_string(),
        })
        .await;
    assert!(matches!(resp, Response::Ok { .. }), "create: {resp:?}");

    client
        .request(&Request::StreamAppend {
            session_id: "s1".to_string(),
            events: EventBody::One(text("Hi")),
        })
        .await;
    client
        .request(&Request::StreamAppend {
            session_id: "s1".to_string(),
            events: EventBody::Many(vec![
                text("there"),
                SessionEvent::MessageComplete {
                    content: "Hi there".to_string(),
                    tool_calls: Vec::new(),
                    input_tokens: None,
                    output_tokens: None,
                    resume_token: None,
                },
            ]),
        })
        .await;

    let snap = snapshot_from(
        client
            .request(&Request::StreamRead {
                session_id: "s1".to_string(),
                from_offset: 0,
                live: false,
            })
            .await,
    );
    assert_eq!(snap.events.len(), 3);
    assert_eq!(snap.next_offset, 3);
    assert_eq!(snap.events[0].offset, 0);

    let tail = snapshot_from(
        client
            .request(&Request::StreamRead {
                session_id: "s1".to_string(),
                from_offset: 2,
                live: false,
            })
            .await,
    );
    assert_eq!(tail.events.len(), 1);
    assert_eq!(tail.events[0].offset, 2);
    assert_eq!(tail.next_offset, 3);

    let resp = client
        .request(&Request::StreamDelete {
            session_id: "s1".to_string(),
        })
        .await;
    assert!(matches!(resp, Response::Ok { .. }), "delete: {resp:?}");

    let resp = client
        .request(&Request::StreamRead {
            session_id: "s1".to_string(),
            from_offset: 0,
            live: false,
        })
        .await;
    match resp {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::StreamNotFound),
        other => panic!("expected stream_not_found, got {other:?}"),
    }
}

#[tokio::test]
async fn append_to_missing_stream_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_server(test_config(dir.path())).await;
    let mut client = Client::connect(&path).await;

    let resp = client
        .request(&Request::StreamAppend {
            session_id: "ghost".to_string(),
            events: EventBody::One(text("x")),
        })
        .await;
    match resp {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::StreamNotFound),
        other => panic!("expected stream_not_found, got {other:?}"),
    }
}

#[tokio::test]
async fn live_read_replays_then_continues_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_server(test_config(dir.path())).await;

    let mut producer = Client::connect(&path).await;
    producer
        .request(&Request::StreamCreate {
            session_id: "s1".to_string(),
        })
        .await;
    producer
        .request(&Request::StreamAppend {
            session_id: "s1".to_string(),
            events: EventBody::Many(vec![text("a"), text("b")]),
        })
        .await;

    let mut viewer = Client::connect(&path).await;
    viewer
        .send(&Request::StreamRead {
            session_id: "s1".to_string(),
            from_offset: 1,
            live: true,
        })
        .await;

    // Catch-up frame for offset 1, then the request acknowledgment.
    match viewer.read_frame().await {
        Response::Entry { entry } => assert_eq!(entry.offset, 1),
        other => panic!("expected entry frame, got {other:?}"),
    }
    match viewer.read_frame().await {
        Response::Ok { .. } => {}
        other => panic!("expected ok, got {other:?}"),
    }

    // An entry appended after subscription flows through live, keeping the
    // offset sequence contiguous.
    producer
        .request(&Request::StreamAppend {
            session_id: "s1".to_string(),
            events: EventBody::One(text("c")),
        })
        .await;
    let frame = timeout(Duration::from_secs(2), viewer.read_frame())
        .await
        .expect("no live frame arrived");
    match frame {
        Response::Entry { entry } => {
            assert_eq!(entry.offset, 2);
            assert_eq!(entry.event, text("c"));
        }
        other => panic!("expected live entry, got {other:?}"),
    }

    // With no traffic, the next frame is a heartbeat, which never carries
    // an offset.
    let frame = timeout(Duration::from_secs(3), viewer.read_frame())
        .await
        .expect("no heartbeat arrived");
    assert!(
        matches!(frame, Response::Heartbeat { .. }),
        "expected heartbeat, got {frame:?}"
    );
}

#[tokio::test]
async fn presence_flow() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_server(test_config(dir.path())).await;
    let mut client = Client::connect(&path).await;

    client
        .request(&Request::PresenceUpdate {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            name: "Ada".to_string(),
            is_typing: true,
        })
        .await;

    let resp = client
        .request(&Request::PresenceGet {
            session_id: "s1".to_string(),
        })
        .await;
    let snapshot: weir_protocol::PresenceSnapshot = match resp {
        Response::Ok { data: Some(data) } => serde_json::from_value(data).unwrap(),
        other => panic!("expected ok, got {other:?}"),
    };
    assert_eq!(snapshot.viewers.len(), 1);
    assert_eq!(snapshot.typing_users.len(), 1);

    client
        .request(&Request::TypingSet {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            is_typing: false,
        })
        .await;
    let resp = client
        .request(&Request::PresenceGet {
            session_id: "s1".to_string(),
        })
        .await;
    let snapshot: weir_protocol::PresenceSnapshot = match resp {
        Response::Ok { data: Some(data) } => serde_json::from_value(data).unwrap(),
        other => panic!("expected ok, got {other:?}"),
    };
    assert_eq!(snapshot.viewers.len(), 1);
    assert!(snapshot.typing_users.is_empty());

    client
        .request(&Request::PresenceLeave {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
        })
        .await;
    let resp = client
        .request(&Request::PresenceGet {
            session_id: "s1".to_string(),
        })
        .await;
    let snapshot: weir_protocol::PresenceSnapshot = match resp {
        Response::Ok { data: Some(data) } => serde_json::from_value(data).unwrap(),
        other => panic!("expected ok, got {other:?}"),
    };
    assert!(snapshot.viewers.is_empty());
}

#[tokio::test]
async fn invalid_request_lines_are_rejected_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_server(test_config(dir.path())).await;
    let mut client = Client::connect(&path).await;

    client.writer.write_all(b"definitely not json\n").await.unwrap();
    client.writer.flush().await.unwrap();
    match client.read_frame().await {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => panic!("expected invalid_request, got {other:?}"),
    }

    // The connection survives and keeps serving requests.
    let resp = client
        .request(&Request::StreamCreate {
            session_id: "s1".to_string(),
        })
        .await;
    assert!(matches!(resp, Response::Ok { .. }));
}

#[tokio::test]
async fn supervised_session_streams_through_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.agent_args = vec![
        "-c".to_string(),
        concat!(
            r#"echo '{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}'; "#,
            r#"echo '{"type":"message_stop"}'"#,
        )
        .to_string(),
    ];
    let path = start_server(config).await;
    let mut client = Client::connect(&path).await;

    let resp = client
        .request(&Request::SessionStart {
            session_id: "s1".to_string(),
            cwd: dir.path().to_path_buf(),
            resume_token: None,
        })
        .await;
    assert!(matches!(resp, Response::Ok { .. }), "start: {resp:?}");

    // Let the agent run to completion and the batch queue flush.
    sleep(Duration::from_millis(500)).await;

    let snap = snapshot_from(
        client
            .request(&Request::StreamRead {
                session_id: "s1".to_string(),
                from_offset: 0,
                live: false,
            })
            .await,
    );
    let kinds: Vec<&SessionEvent> = snap.events.iter().map(|e| &e.event).collect();
    assert_eq!(kinds.len(), 4, "events: {kinds:?}");
    assert_eq!(kinds[0], &SessionEvent::SessionStart);
    assert_eq!(kinds[1], &text("Hi"));
    assert!(matches!(kinds[2], SessionEvent::MessageComplete { .. }));
    assert!(matches!(kinds[3], SessionEvent::SessionEnd { .. }));

    // The session reaped itself from the active table on exit.
    let resp = client.request(&Request::SessionList).await;
    match resp {
        Response::Ok { data: Some(data) } => {
            assert_eq!(data["sessions"].as_array().unwrap().len(), 0);
        }
        other => panic!("expected ok, got {other:?}"),
    }
}
