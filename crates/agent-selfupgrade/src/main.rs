//! The self-upgrader: replaces the agent's own installation under a process
//! supervisor. Invoked by the running agent as a detached child when an OTA
//! update targets the agent's own entry file, per the self-upgrade
//! short-circuit in the OTA engine.

mod installer;
mod status;
mod supervisor;

use std::path::PathBuf;

use agent_core::config::load_config;
use agent_core::{AgentError, OtaStatusMessage, UpgradeStatus};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use crate::status::StatusReporter;
use crate::supervisor::SupervisorClient;

#[derive(Parser, Debug)]
#[command(name = "iot-agent-selfupgrade", about = "In-place self-upgrade for the OTA agent")]
struct Args {
    /// Path to the downloaded archive to install.
    #[arg(long)]
    file: PathBuf,

    /// The agent's current installation directory, replaced in place.
    #[arg(long, default_value = ".")]
    install_dir: PathBuf,

    /// Entry file expected inside the extracted archive.
    #[arg(long, default_value = "IoTAgent.py")]
    entry_name: String,

    /// Up-topic to publish status updates to.
    #[arg(long)]
    up_topic: String,

    /// Path to the agent's TOML configuration, used for broker settings.
    #[arg(long, default_value = "agent.toml")]
    config: PathBuf,

    /// Supervisor service name controlling the agent process.
    #[arg(long, default_value = "IoTAgent")]
    service_name: String,

    /// Supervisor CLI binary.
    #[arg(long, default_value = "supervisorctl")]
    supervisor_binary: String,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let exit_code = run(&args).await;
    std::process::ExitCode::from(exit_code)
}

async fn run(args: &Args) -> u8 {
    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return 2;
        }
    };

    let reporter = match StatusReporter::connect(
        "iot-agent-selfupgrade",
        &config.transport.primary,
        args.up_topic.clone(),
    )
    .await
    {
        Ok(r) => r,
        Err(err) => {
            // Can't report status without a reporter, but the upgrade can
            // still proceed; the agent's own absence will be noticed via the
            // online beacon going quiet.
            warn!(%err, "failed to connect to broker for status reporting");
            return run_upgrade(args, None).await;
        }
    };

    run_upgrade(args, Some(&reporter)).await
}

async fn run_upgrade(args: &Args, reporter: Option<&StatusReporter>) -> u8 {
    report(reporter, UpgradeStatus::StartUpdate).await;

    let supervisor = SupervisorClient::new(args.supervisor_binary.clone(), args.service_name.clone());
    let backup_dir = args.install_dir.with_extension("selfupgrade_backup");

    let outcome = perform_upgrade(args, &supervisor, &backup_dir).await;

    match outcome {
        Ok(()) => {
            info!("self-upgrade completed successfully");
            report(
                reporter,
                UpgradeStatus::UpdateSuccess {
                    version: args.file.to_string_lossy().to_string(),
                },
            )
            .await;
            0
        }
        Err(err) => {
            error!(%err, "self-upgrade failed, rolling back");
            match rollback(&supervisor, &args.install_dir, &backup_dir).await {
                Ok(()) => {
                    report(
                        reporter,
                        UpgradeStatus::UpdateFailed {
                            error: format!("{err}; rolled back, previous version restored"),
                        },
                    )
                    .await;
                    1
                }
                Err(rollback_err) => {
                    error!(%rollback_err, "rollback failed, installation may be in an inconsistent state");
                    report(
                        reporter,
                        UpgradeStatus::UpdateFailed {
                            error: format!("{err}; rollback also failed: {rollback_err}"),
                        },
                    )
                    .await;
                    2
                }
            }
        }
    }
}

async fn perform_upgrade(
    args: &Args,
    supervisor: &SupervisorClient,
    backup_dir: &std::path::Path,
) -> Result<(), AgentError> {
    let temp_dir = tempfile::Builder::new()
        .prefix("iot-agent-selfupgrade-")
        .tempdir()?;

    supervisor.stop().await?;
    installer::snapshot(&args.install_dir, backup_dir)?;

    agent_core::archive::extract(&args.file, temp_dir.path())?;

    let source_dir = installer::detect_source_dir(temp_dir.path(), &args.entry_name)?;
    installer::replace_install_dir(&args.install_dir, &source_dir)?;

    supervisor.start().await?;
    if !supervisor.wait_running().await? {
        return Err(AgentError::SupervisorFailure(
            "service did not report running after restart".to_string(),
        ));
    }

    Ok(())
}

async fn rollback(
    supervisor: &SupervisorClient,
    install_dir: &std::path::Path,
    backup_dir: &std::path::Path,
) -> Result<(), AgentError> {
    installer::restore_from_backup(install_dir, backup_dir)?;
    supervisor.start().await?;
    supervisor.wait_running().await?;
    Ok(())
}

async fn report(reporter: Option<&StatusReporter>, status: UpgradeStatus) {
    if let Some(reporter) = reporter {
        reporter.publish(OtaStatusMessage::new(status)).await;
    }
}

fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(true).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
