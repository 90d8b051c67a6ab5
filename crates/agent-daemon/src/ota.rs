//! The OTA upgrade engine: per-binding state machine coordinating download,
//! stop, backup, extract, version write and relaunch. Grounded on the
//! reference daemon's `OtaService` (worker-per-update spawned off an
//! `Arc<RwLock<HashMap<..>>>` registry, `broadcast` events for state
//! changes) generalized from firmware-manifest OTA to archive-based OTA per
//! the legacy Python service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_core::{archive, AgentError, DeviceBinding, OtaStatusMessage, UpgradeStatus};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::downloader::{self, Downloader};
use crate::process;
use crate::registry::DeviceRegistry;
use crate::transport::Transport;

const POST_KILL_SETTLE: Duration = Duration::from_secs(2);

pub struct OtaEngine {
    registry: Arc<DeviceRegistry>,
    downloader: Arc<Downloader>,
    transport: Arc<Transport>,
    agent_dir: PathBuf,
    max_backup_count: usize,
    selfupgrade_binary: PathBuf,
    config_path: PathBuf,
}

impl OtaEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        downloader: Arc<Downloader>,
        transport: Arc<Transport>,
        agent_dir: PathBuf,
        max_backup_count: usize,
        selfupgrade_binary: PathBuf,
        config_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            downloader,
            transport,
            agent_dir,
            max_backup_count,
            selfupgrade_binary,
            config_path,
        })
    }

    async fn publish(&self, binding: &DeviceBinding, status: UpgradeStatus) {
        let message = OtaStatusMessage::new(status).to_json();
        self.transport.publish(&binding.up_topic, &message).await;
    }

    /// `Download` command. Drops the request if a download is already in
    /// flight for this binding — the in-flight download owns the terminal
    /// status publish.
    pub fn download(self: &Arc<Self>, binding: DeviceBinding, url: String, md5: Option<String>) {
        let engine = self.clone();
        tokio::spawn(async move {
            if !engine.registry.try_begin_download(&binding.key).await {
                return;
            }
            engine
                .publish(
                    &binding,
                    UpgradeStatus::Downloading {
                        timestamp: unix_timestamp(),
                    },
                )
                .await;

            match engine.downloader.download(&url, md5.as_deref()).await {
                Ok(outcome) => {
                    info!(key = %binding.key, path = %outcome.path.display(), "download succeeded");
                    engine
                        .publish(
                            &binding,
                            UpgradeStatus::DownloadSuccess {
                                path: outcome.path.to_string_lossy().to_string(),
                                timestamp: unix_timestamp(),
                            },
                        )
                        .await;
                }
                Err(err) => {
                    let message = downloader::classify_failure(&err);
                    warn!(key = %binding.key, error = %message, "download failed");
                    engine
                        .publish(&binding, UpgradeStatus::DownloadFailed { error: message })
                        .await;
                }
            }

            engine.registry.end_download(&binding.key).await;
        });
    }

    /// `Stop` command. If nothing is in flight, reports `update stopped`
    /// immediately (legacy quirk: this also resets, not sets, the stop
    /// flag). Otherwise flags the in-flight worker for cooperative
    /// cancellation.
    pub fn stop(self: &Arc<Self>, binding: DeviceBinding) {
        let engine = self.clone();
        tokio::spawn(async move {
            let immediate = engine.registry.request_stop(&binding.key).await;
            if immediate {
                engine.publish(&binding, UpgradeStatus::UpdateStopped).await;
            }
        });
    }

    /// `StartUpdate` command, iff no update is already in flight for this
    /// binding.
    pub fn start_update(
        self: &Arc<Self>,
        binding: DeviceBinding,
        target_path: String,
        archive_path: String,
        filename: Option<String>,
        version: String,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            if !engine.registry.try_begin_update(&binding.key).await {
                return;
            }
            engine
                .run_update(&binding, &target_path, &archive_path, filename.as_deref(), &version)
                .await;
            engine.registry.finish_update(&binding.key).await;
        });
    }

    async fn run_update(
        &self,
        binding: &DeviceBinding,
        target_path: &str,
        archive_path: &str,
        filename: Option<&str>,
        version: &str,
    ) {
        if !Path::new(archive_path).exists() {
            self.publish(
                binding,
                UpgradeStatus::UpdateFailed {
                    error: "未找到资源包".to_string(),
                },
            )
            .await;
            return;
        }

        let file_name = filename
            .map(str::to_string)
            .or_else(|| {
                Path::new(archive_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| version.to_string());

        let target_dir = resolve_target_dir(target_path, &file_name);

        if binding.is_self() {
            self.spawn_self_upgrade(binding, archive_path).await;
            return;
        }

        match self
            .run_update_stages(binding, &target_dir, archive_path, version)
            .await
        {
            Ok(()) => {
                self.publish(
                    binding,
                    UpgradeStatus::UpdateSuccess {
                        version: version.to_string(),
                    },
                )
                .await;
            }
            Err(AgentError::Cancelled) => {
                info!(key = %binding.key, "update cancelled");
                self.publish(binding, UpgradeStatus::UpdateStopped).await;
            }
            Err(err) => {
                error!(key = %binding.key, %err, "update failed");
                self.publish(
                    binding,
                    UpgradeStatus::UpdateFailed {
                        error: err.to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn run_update_stages(
        &self,
        binding: &DeviceBinding,
        target_dir: &Path,
        archive_path: &str,
        version: &str,
    ) -> Result<(), AgentError> {
        self.publish(binding, UpgradeStatus::StartUpdate).await;

        self.check_stop(binding).await?;
        if !process::kill(&binding.entry_name).await? {
            info!(key = %binding.key, "no running process matched for kill");
        }

        sleep(POST_KILL_SETTLE).await;

        self.check_stop(binding).await?;
        backup_directory(target_dir, self.max_backup_count)?;

        self.check_stop(binding).await?;
        archive::extract(Path::new(archive_path), target_dir)?;

        write_version_file(target_dir, version)?;

        self.check_stop(binding).await?;
        process::launch(target_dir, binding).await?;

        merge_agent_version(&self.agent_dir, &binding.entry_name, version);

        Ok(())
    }

    async fn check_stop(&self, binding: &DeviceBinding) -> Result<(), AgentError> {
        if self.registry.is_stop_requested(&binding.key).await {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Self-upgrade short-circuit: spawn the self-upgrader as a detached
    /// child and return without running any in-process kill/backup/extract
    /// or publishing a terminal status — the child owns that.
    async fn spawn_self_upgrade(&self, binding: &DeviceBinding, archive_path: &str) {
        let selfupgrade_args = [
            "--file",
            archive_path,
            "--install-dir",
            &binding.directory,
            "--entry-name",
            &binding.entry_name,
            "--up-topic",
            &binding.up_topic,
            "--config",
        ];
        let config_path = self.config_path.to_string_lossy().to_string();

        let result = if let Some(conda_env) = &binding.conda_env {
            match process::resolve_conda_executable() {
                Some(conda) => {
                    tokio::process::Command::new(conda)
                        .args(["run", "-n", conda_env, "python"])
                        .arg(&self.selfupgrade_binary)
                        .args(selfupgrade_args)
                        .arg(&config_path)
                        .current_dir(&binding.directory)
                        .stdout(std::process::Stdio::null())
                        .stderr(std::process::Stdio::null())
                        .spawn()
                }
                None => {
                    self.publish(
                        binding,
                        UpgradeStatus::UpdateFailed {
                            error: "conda环境未找到".to_string(),
                        },
                    )
                    .await;
                    return;
                }
            }
        } else {
            tokio::process::Command::new(&self.selfupgrade_binary)
                .args(selfupgrade_args)
                .arg(&config_path)
                .current_dir(&binding.directory)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
        };

        match result {
            Ok(_) => info!(key = %binding.key, "spawned self-upgrader"),
            Err(err) => error!(key = %binding.key, %err, "failed to spawn self-upgrader"),
        }
    }
}

fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Append `file_name` to `target_path` unless its last component already
/// equals `file_name` (idempotence-preserving).
fn resolve_target_dir(target_path: &str, file_name: &str) -> PathBuf {
    let path = Path::new(target_path);
    if path.file_name().map(|n| n.to_string_lossy()) == Some(file_name.into()) {
        path.to_path_buf()
    } else {
        path.join(file_name)
    }
}

/// Rename `target_dir` (if present) to a timestamped backup, then prune
/// backups beyond `max_backup_count` by mtime descending.
fn backup_directory(target_dir: &Path, max_backup_count: usize) -> Result<(), AgentError> {
    if !target_dir.exists() {
        return Ok(());
    }

    let name = target_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = target_dir.parent().unwrap_or_else(|| Path::new("."));
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let backup_dir = parent.join(format!("{name}_backup_{timestamp}"));
    std::fs::rename(target_dir, &backup_dir)?;
    info!(backup = %backup_dir.display(), "backed up directory");

    let prefix = format!("{name}_backup_");
    let mut backups: Vec<(std::fs::Metadata, PathBuf)> = std::fs::read_dir(parent)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&prefix)
        })
        .filter_map(|entry| entry.metadata().ok().map(|meta| (meta, entry.path())))
        .collect();

    backups.sort_by_key(|(meta, _)| std::cmp::Reverse(meta.modified().ok()));

    for (_, old_dir) in backups.into_iter().skip(max_backup_count) {
        if let Err(err) = std::fs::remove_dir_all(&old_dir) {
            warn!(dir = %old_dir.display(), %err, "failed to prune old backup");
        } else {
            info!(dir = %old_dir.display(), "pruned old backup");
        }
    }

    Ok(())
}

fn write_version_file(target_dir: &Path, version: &str) -> Result<(), AgentError> {
    std::fs::write(target_dir.join("version.txt"), version)?;
    Ok(())
}

/// Merge `{entryName: version}` into `./version.json`, tolerating a corrupt
/// or absent file by starting fresh with a logged warning.
fn merge_agent_version(agent_dir: &Path, entry_name: &str, version: &str) {
    let path = agent_dir.join("version.json");
    let mut data: Map<String, Value> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_else(|| {
            warn!(path = %path.display(), "version file missing or corrupt, starting fresh");
            Map::new()
        });
    data.insert(entry_name.to_string(), Value::String(version.to_string()));
    match serde_json::to_string_pretty(&data) {
        Ok(content) => {
            if let Err(err) = std::fs::write(&path, content) {
                warn!(path = %path.display(), %err, "failed to write version file");
            }
        }
        Err(err) => warn!(%err, "failed to serialize version file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_dir_appends_file_name_when_not_already_present() {
        let dir = resolve_target_dir("/opt/app", "1.2.3");
        assert_eq!(dir, PathBuf::from("/opt/app/1.2.3"));
    }

    #[test]
    fn target_dir_is_idempotent_when_already_versioned() {
        let dir = resolve_target_dir("/opt/app/1.2.3", "1.2.3");
        assert_eq!(dir, PathBuf::from("/opt/app/1.2.3"));
    }

    #[test]
    fn backup_prunes_beyond_max_count() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app");
        std::fs::create_dir(&target).unwrap();
        backup_directory(&target, 1).unwrap();

        std::fs::create_dir(&target).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        backup_directory(&target, 1).unwrap();

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("app_backup_"))
            .collect();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn merge_agent_version_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        merge_agent_version(dir.path(), "main.py", "1.2.3");
        let content = std::fs::read_to_string(dir.path().join("version.json")).unwrap();
        let data: Map<String, Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(data["main.py"], "1.2.3");
    }

    #[test]
    fn merge_agent_version_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version.json"), "not json").unwrap();
        merge_agent_version(dir.path(), "main.py", "2.0.0");
        let content = std::fs::read_to_string(dir.path().join("version.json")).unwrap();
        let data: Map<String, Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(data["main.py"], "2.0.0");
    }
}
