use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "weir_protocol::paths::default_socket_path")]
    pub socket_path: PathBuf,
    /// Agent binary spawned for each session.
    #[serde(default = "default_agent_program")]
    pub agent_program: PathBuf,
    /// Arguments always passed to the agent.
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// Flag passed with a resume token when continuing a conversation.
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Keep-alive interval for live subscriptions.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults
        let config_path = weir_protocol::paths::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: weir_protocol::paths::default_socket_path(),
            agent_program: default_agent_program(),
            agent_args: Vec::new(),
            resume_flag: default_resume_flag(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_agent_program() -> PathBuf {
    PathBuf::from("agent")
}

fn default_resume_flag() -> String {
    "--resume".to_string()
}

fn default_heartbeat_secs() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.agent_program, PathBuf::from("agent"));
        assert_eq!(config.resume_flag, "--resume");
        assert_eq!(config.heartbeat_secs, 15);
    }

    #[test]
    fn fields_override_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            socket_path = "/tmp/custom.sock"
            agent_program = "/usr/local/bin/agent"
            agent_args = ["--output-format", "stream-json"]
            heartbeat_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/custom.sock"));
        assert_eq!(config.agent_args.len(), 2);
        assert_eq!(config.heartbeat_secs, 5);
    }
}
