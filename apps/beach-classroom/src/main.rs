use anyhow::Result;
use beach_classroom::{
    config::{Cli, ServerConfig},
    server,
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        internal_addr = %config.internal_addr,
        allowed_origin = ?config.allowed_origin,
        reaper_interval_secs = config.reaper_interval.as_secs(),
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "starting beach-classroom"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
