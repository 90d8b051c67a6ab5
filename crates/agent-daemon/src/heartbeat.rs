//! Heartbeat watcher: managed programs report `{program, timestamp,
//! reload_command}` and are relaunched if they go quiet. Grounded on the
//! reference daemon's periodic scan loop in `scanner.rs` (`tokio::time::interval`
//! driving a sweep over shared state).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_core::{DeviceBinding, Heartbeat};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{info, warn};

use crate::process;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

struct TrackedProgram {
    last_seen: f64,
    reload_command: Option<String>,
}

pub struct HeartbeatWatcher {
    programs: RwLock<HashMap<String, TrackedProgram>>,
    stale_after_secs: f64,
}

impl HeartbeatWatcher {
    pub fn new(stale_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            programs: RwLock::new(HashMap::new()),
            stale_after_secs: stale_after.as_secs_f64(),
        })
    }

    pub fn with_default_timeout() -> Arc<Self> {
        Self::new(DEFAULT_STALE_AFTER)
    }

    /// Record (or refresh) a heartbeat, keyed by program name.
    pub async fn record(&self, heartbeat: Heartbeat) {
        self.programs.write().await.insert(
            heartbeat.program,
            TrackedProgram {
                last_seen: heartbeat.timestamp,
                reload_command: heartbeat.reload_command,
            },
        );
    }

    /// Spawn the periodic sweep: every [`SWEEP_INTERVAL`], relaunch any
    /// program whose last heartbeat is older than `stale_after_secs`.
    pub fn spawn_sweep(self: &Arc<Self>) {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                watcher.sweep_once().await;
            }
        });
    }

    async fn sweep_once(&self) {
        let now = unix_timestamp();
        let stale: Vec<(String, Option<String>)> = {
            let programs = self.programs.read().await;
            programs
                .iter()
                .filter(|(_, tracked)| now - tracked.last_seen > self.stale_after_secs)
                .map(|(name, tracked)| (name.clone(), tracked.reload_command.clone()))
                .collect()
        };

        for (program, reload_command) in stale {
            warn!(program, "heartbeat stale, relaunching");
            let Some(reload_command) = reload_command else {
                warn!(program, "stale heartbeat has no reload command, cannot relaunch");
                self.programs.write().await.remove(&program);
                continue;
            };

            let binding = DeviceBinding {
                key: program.clone(),
                is_custom: true,
                directory: ".".to_string(),
                entry_name: program.clone(),
                conda_env: None,
                start_command: Some(reload_command),
                up_topic: String::new(),
            };
            if let Err(err) = process::launch(std::path::Path::new("."), &binding).await {
                warn!(program, %err, "failed to relaunch stale program");
                continue;
            }
            info!(program, "relaunched stale program");
            self.programs.write().await.remove(&program);
        }
    }
}

fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_ignores_fresh_heartbeats() {
        let watcher = HeartbeatWatcher::new(Duration::from_secs(5));
        watcher
            .record(Heartbeat {
                program: "main.py".into(),
                timestamp: unix_timestamp(),
                reload_command: Some("python main.py".into()),
            })
            .await;
        watcher.sweep_once().await;
        assert_eq!(watcher.programs.read().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_drops_stale_entry_even_when_relaunch_fails() {
        let watcher = HeartbeatWatcher::new(Duration::from_secs(5));
        watcher
            .record(Heartbeat {
                program: "missing.py".into(),
                timestamp: 0.0,
                reload_command: Some("not-a-real-binary-xyz".into()),
            })
            .await;
        watcher.sweep_once().await;
        // relaunch fails (binary does not exist), so the stale entry is
        // retained for the next sweep rather than silently dropped.
        assert_eq!(watcher.programs.read().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_drops_stale_entry_with_no_reload_command() {
        let watcher = HeartbeatWatcher::new(Duration::from_secs(5));
        watcher
            .record(Heartbeat {
                program: "orphan.py".into(),
                timestamp: 0.0,
                reload_command: None,
            })
            .await;
        watcher.sweep_once().await;
        assert_eq!(watcher.programs.read().await.len(), 0);
    }
}
