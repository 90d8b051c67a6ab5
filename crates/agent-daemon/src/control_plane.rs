//! Inbound message dispatch: subscribes to each binding's down-topic plus
//! the agent's own, classifies each payload and routes it to the OTA engine
//! or the registry. Grounded on the reference daemon's websocket dispatch
//! loop (`tokio::select!` over an inbound channel, one handler per message
//! kind).

use std::sync::Arc;

use agent_core::{
    AgentDevicePayload, DeviceBinding, InboundMessage, OtaStatusMessage, UpgradeCommand,
    UpgradeStatus,
};
use rumqttc::Publish;
use tracing::{debug, warn};

use crate::ota::OtaEngine;
use crate::process;
use crate::registry::DeviceRegistry;
use crate::transport::Transport;

pub struct ControlPlane {
    registry: Arc<DeviceRegistry>,
    ota: Arc<OtaEngine>,
    transport: Arc<Transport>,
    self_id: String,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ota: Arc<OtaEngine>,
        transport: Arc<Transport>,
        self_id: String,
    ) -> Self {
        Self {
            registry,
            ota,
            transport,
            self_id,
        }
    }

    /// Handle one incoming MQTT publish. Malformed payloads are dropped with
    /// a warning.
    pub async fn handle_publish(&self, publish: Publish) {
        let device_id = match extract_device_id(&publish.topic) {
            Some(id) => id,
            None => {
                warn!(topic = %publish.topic, "dropped message with unparseable topic");
                return;
            }
        };

        let message: InboundMessage = match serde_json::from_slice(&publish.payload) {
            Ok(m) => m,
            Err(err) => {
                warn!(topic = %publish.topic, %err, "dropped unparseable payload");
                return;
            }
        };

        self.dispatch(&device_id, message).await;
    }

    async fn dispatch(&self, device_id: &str, message: InboundMessage) {
        let command = message.classify();
        debug!(device_id, ?command, "dispatching command");

        match command {
            UpgradeCommand::Download {
                url,
                md5,
                process_path,
                entry,
                conda_env,
            } => {
                if let Some(binding) = self
                    .resolve_binding(device_id, process_path.as_deref(), entry.as_deref(), conda_env.as_deref())
                    .await
                {
                    self.ota.download(binding, url, md5);
                } else {
                    self.report_unknown_device(device_id).await;
                }
            }
            UpgradeCommand::Stop {
                process_path,
                entry,
                conda_env,
            } => {
                if let Some(binding) = self
                    .resolve_binding(device_id, process_path.as_deref(), entry.as_deref(), conda_env.as_deref())
                    .await
                {
                    self.ota.stop(binding);
                } else {
                    self.report_unknown_device(device_id).await;
                }
            }
            UpgradeCommand::StartUpdate {
                path,
                filename,
                version,
                process_path,
                entry,
                conda_env,
            } => {
                if let Some(binding) = self
                    .resolve_binding(device_id, process_path.as_deref(), entry.as_deref(), conda_env.as_deref())
                    .await
                {
                    let target_path = process_path
                        .clone()
                        .filter(|p| !p.is_empty())
                        .unwrap_or_else(|| binding.directory.clone());
                    if target_path.is_empty() {
                        self.publish_up(
                            &binding,
                            UpgradeStatus::UpdateFailed {
                                error: "未找到目标路径".to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                    self.ota
                        .start_update(binding, target_path, path, filename, version);
                } else {
                    self.report_unknown_device(device_id).await;
                }
            }
            UpgradeCommand::AgentDeviceAdd(payload) => {
                self.add_or_update_binding(device_id, payload).await;
            }
            UpgradeCommand::AgentDeviceUpdate(payload) => {
                self.add_or_update_binding(device_id, payload).await;
            }
            UpgradeCommand::AgentDeviceDelete(payload) => {
                let key = binding_key(device_id, &payload);
                self.registry.remove(&key).await;
            }
            UpgradeCommand::Restart {
                directory,
                entry_name,
                conda_env,
                start_command,
            } => {
                let binding = DeviceBinding {
                    key: format!("{directory}/{entry_name}"),
                    is_custom: true,
                    directory: directory.clone(),
                    entry_name: entry_name.clone(),
                    conda_env,
                    start_command,
                    up_topic: self.up_topic(device_id),
                };
                self.restart(&binding).await;
            }
            UpgradeCommand::Unknown => {
                debug!(device_id, "ignored message: no recognized command");
            }
        }
    }

    /// Resolve a binding for `device_id`: a registered binding if known,
    /// otherwise a synthesized custom binding when `device_id` is the
    /// agent's own id (legacy "process self-targeting" behavior) derived
    /// from the message's `processPath`/`entry`/`condaEnv`, keyed like a
    /// registered custom device (`directory/entryName`) so a repeated
    /// self-targeted command reuses the same binding.
    async fn resolve_binding(
        &self,
        device_id: &str,
        process_path: Option<&str>,
        entry: Option<&str>,
        conda_env: Option<&str>,
    ) -> Option<DeviceBinding> {
        if let Some(binding) = self.registry.get(device_id).await {
            return Some(binding);
        }
        if device_id == self.self_id {
            let (Some(directory), Some(entry_name)) = (process_path, entry) else {
                return None;
            };
            let binding = DeviceBinding {
                key: format!("{directory}/{entry_name}"),
                is_custom: true,
                directory: directory.to_string(),
                entry_name: entry_name.to_string(),
                conda_env: conda_env.map(str::to_string),
                start_command: None,
                up_topic: self.up_topic(device_id),
            };
            return Some(self.registry.get_or_insert(binding).await);
        }
        None
    }

    async fn add_or_update_binding(&self, device_id: &str, payload: AgentDevicePayload) {
        let key = binding_key(device_id, &payload);
        let binding = DeviceBinding {
            key: key.clone(),
            is_custom: payload.is_custom_device,
            directory: payload.directory.clone().unwrap_or_default(),
            entry_name: payload.entry_name.clone().unwrap_or_default(),
            conda_env: payload.conda_env.clone(),
            start_command: payload.start_command.clone(),
            up_topic: self.up_topic(device_id),
        };
        self.registry.add(binding).await;
    }

    async fn restart(&self, binding: &DeviceBinding) {
        let _ = process::kill(&binding.entry_name).await;
        if let Err(err) = process::launch(std::path::Path::new(&binding.directory), binding).await
        {
            warn!(key = %binding.key, %err, "restart failed to relaunch process");
        }
    }

    /// Legacy quirk: an unrecognized device id is reported on the *down*
    /// topic, not the up topic.
    async fn report_unknown_device(&self, device_id: &str) {
        let down_topic = down_topic(device_id);
        let message = OtaStatusMessage::new(UpgradeStatus::UpdateFailed {
            error: "未找到设备信息".to_string(),
        })
        .to_json();
        self.transport.publish(&down_topic, &message).await;
    }

    async fn publish_up(&self, binding: &DeviceBinding, status: UpgradeStatus) {
        let message = OtaStatusMessage::new(status).to_json();
        self.transport.publish(&binding.up_topic, &message).await;
    }

    fn up_topic(&self, device_id: &str) -> String {
        format!("/devices/{device_id}/sys/messages/up")
    }
}

fn down_topic(device_id: &str) -> String {
    format!("/devices/{device_id}/sys/messages/down")
}

/// A topic is shaped `/devices/{id}/sys/messages/down`; the device id is the
/// third path segment.
fn extract_device_id(topic: &str) -> Option<String> {
    topic.split('/').nth(2).map(str::to_string)
}

fn binding_key(device_id: &str, payload: &AgentDevicePayload) -> String {
    if payload.is_custom_device {
        let directory = payload.directory.clone().unwrap_or_default();
        let entry_name = payload.entry_name.clone().unwrap_or_default();
        format!("{directory}/{entry_name}")
    } else {
        payload.device_id.clone().unwrap_or_else(|| device_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_device_id_from_topic() {
        assert_eq!(
            extract_device_id("/devices/D1/sys/messages/down"),
            Some("D1".to_string())
        );
        assert_eq!(extract_device_id("short/topic"), None);
    }

    #[test]
    fn binding_key_uses_directory_and_entry_for_custom_devices() {
        let payload = AgentDevicePayload {
            is_custom_device: true,
            directory: Some("/opt/app".into()),
            entry_name: Some("main.py".into()),
            conda_env: None,
            start_command: None,
            device_id: None,
        };
        assert_eq!(binding_key("D1", &payload), "/opt/app/main.py");
    }

    #[test]
    fn binding_key_falls_back_to_topic_device_id_for_registered_devices() {
        let payload = AgentDevicePayload {
            is_custom_device: false,
            directory: None,
            entry_name: None,
            conda_env: None,
            start_command: None,
            device_id: None,
        };
        assert_eq!(binding_key("D1", &payload), "D1");
    }
}
