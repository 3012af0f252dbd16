use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scopecast_relay::probe::{self, ProbeArgs};
use scopecast_relay::telemetry::Telemetry;
use scopecast_relay::{LogFormat, Relay, RelayConfig, ServeArgs};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "scopecast-relay",
    author,
    version,
    about = "scopecast signaling relay and debug client"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay.
    Serve(ServeArgs),
    /// Connect to a relay and print what it sends.
    Probe(ProbeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Probe(args) => {
            let _telemetry = Telemetry::init(LogFormat::Text)?;
            probe::run(args).await
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let telemetry = Telemetry::init(args.log_format)?;
    let config = RelayConfig::try_from(args)?;
    info!(
        listen_addr = %config.listen_addr,
        outbound_buffer = config.outbound_buffer,
        slow_peer_policy = ?config.slow_peer_policy,
        id_scheme = ?config.id_scheme,
        "starting scopecast relay"
    );

    let relay = Relay::bind(&config, Some(telemetry.metrics_handle())).await?;
    info!("scopecast relay listening on {}", relay.local_addr()?);
    relay
        .serve(shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
