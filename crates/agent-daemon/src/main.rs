//! Entry point for the resident OTA agent. Mirrors the reference daemon's
//! `main.rs`: a `clap`-parsed `Args`, a `tracing` subscriber configured from
//! a log-level string, then config load -> override -> construction -> run.

mod agent;
mod control_plane;
mod downloader;
mod heartbeat;
mod http_client;
mod ota;
mod process;
mod registry;
mod transport;

use std::path::PathBuf;

use agent_core::config::load_config;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::agent::Agent;

#[derive(Parser, Debug)]
#[command(name = "iot-agent", about = "Resident OTA upgrade agent")]
struct Args {
    /// Path to the agent's TOML configuration file.
    #[arg(long, default_value = "agent.toml")]
    config: PathBuf,

    /// Override the primary MQTT broker host from the config file.
    #[arg(long)]
    broker: Option<String>,

    /// Path to the self-upgrader binary, spawned for self-targeted updates.
    #[arg(long, default_value = "iot-agent-selfupgrade")]
    selfupgrade_binary: PathBuf,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_config(&args.config)?;
    if let Some(broker) = args.broker {
        config.transport.primary.host = broker;
    }

    let agent = Agent::bootstrap(config, args.selfupgrade_binary, args.config).await?;
    tracing::info!(agent_id = agent.agent_id(), "agent starting");
    agent.run().await
}
