use tracing_subscriber::EnvFilter;

use weir_server::{config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("weir=info".parse()?))
        .init();

    let config = config::ServerConfig::load()?;
    server::run(config).await
}
