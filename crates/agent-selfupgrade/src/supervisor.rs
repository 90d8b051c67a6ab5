//! A thin client for the external process supervisor (an init-style service
//! manager, e.g. Supervisor's `supervisorctl`) that owns starting and
//! stopping the agent process across its own in-place upgrade. Treated as an
//! external collaborator: this module only shells out to its CLI and parses
//! its status output.

use agent_core::AgentError;
use tokio::process::Command;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_POLL_ATTEMPTS: u32 = 10;

pub struct SupervisorClient {
    binary: String,
    service: String,
}

impl SupervisorClient {
    pub fn new(binary: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            service: service.into(),
        }
    }

    /// Stop the service. A service that is already stopped is not an error
    /// (the supervisor's own `stop` is idempotent).
    pub async fn stop(&self) -> Result<(), AgentError> {
        self.run(&["stop", &self.service]).await?;
        info!(service = %self.service, "stopped service");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        self.run(&["start", &self.service]).await?;
        info!(service = %self.service, "started service");
        Ok(())
    }

    /// Poll `status` until it reports `RUNNING`, up to a bounded number of
    /// attempts.
    pub async fn wait_running(&self) -> Result<bool, AgentError> {
        for attempt in 1..=STATUS_POLL_ATTEMPTS {
            if self.is_running().await? {
                return Ok(true);
            }
            warn!(attempt, service = %self.service, "service not yet running");
            sleep(STATUS_POLL_INTERVAL).await;
        }
        Ok(false)
    }

    async fn is_running(&self) -> Result<bool, AgentError> {
        let output = self.run(&["status", &self.service]).await?;
        Ok(output.contains("RUNNING"))
    }

    async fn run(&self, args: &[&str]) -> Result<String, AgentError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::SupervisorFailure(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(stdout)
    }
}
