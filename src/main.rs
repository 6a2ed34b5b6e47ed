use clap::Parser;
use fronius_grid_bridge::config::{BridgeConfig, Command};
use fronius_grid_bridge::service;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = BridgeConfig::parse();
    config.validate()?;

    match config.command() {
        Command::Run => {
            info!("Starting Fronius grid bridge");
            service::run(&config).await
        }
        Command::Snapshot => service::snapshot(&config).await,
    }
}
