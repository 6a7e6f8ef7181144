use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tracing::{error, info, warn};

use libweir::batch::EventSink;
use libweir::{EventLog, LogSink, PresenceTracker, Supervisor, SupervisorConfig};

use crate::config::ServerConfig;
use crate::connection;

/// Long-lived service instances shared by every client connection.
pub struct Shared {
    pub log: Arc<EventLog>,
    pub presence: PresenceTracker,
    pub supervisor: Arc<Supervisor>,
    pub heartbeat: Duration,
}

pub fn build_shared(config: &ServerConfig) -> Arc<Shared> {
    let log = Arc::new(EventLog::new());
    let sink: Arc<dyn EventSink> = Arc::new(LogSink::new(Arc::clone(&log)));

    let mut supervisor_config = SupervisorConfig::new(&config.agent_program);
    supervisor_config.base_args = config.agent_args.clone();
    supervisor_config.resume_flag = config.resume_flag.clone();

    Arc::new(Shared {
        log,
        presence: PresenceTracker::new(),
        supervisor: Arc::new(Supervisor::new(supervisor_config, sink)),
        heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
    })
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write PID file (best-effort; the daemon runs fine without one)
    let pid_path = weir_protocol::paths::pid_file_path();
    if let Some(parent) = pid_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(path = %pid_path.display(), error = %e, "could not write pid file");
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    info!(socket = %config.socket_path.display(), pid = std::process::id(), "weir server started");

    let shared = build_shared(&config);

    // Handle shutdown signals
    let socket_path = config.socket_path.clone();
    let pid_path_clone = pid_path.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        // Cleanup
        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&pid_path_clone);
        std::process::exit(0);
    });

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    connection::handle_client(stream, shared).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}
