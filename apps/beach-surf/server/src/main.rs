use anyhow::Result;
use beach_surf_server::{run, telemetry::Telemetry, Cli, ServerConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        active_key = config.keyring.active_key_id(),
        outbound_buffer = config.outbound_buffer,
        "starting beach-surf server"
    );

    run(config, telemetry.metrics_handle()).await
}
