//! Wire and domain types: bindings, inbound control messages and outbound
//! status reports.

use serde::{Deserialize, Serialize};

/// A managed workload bound to this agent.
///
/// `key` is either the fleet-assigned device id (registered device) or
/// `directory + "/" + entryName` (custom device) — see the registry for key
/// derivation rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceBinding {
    pub key: String,
    pub is_custom: bool,
    pub directory: String,
    pub entry_name: String,
    pub conda_env: Option<String>,
    pub start_command: Option<String>,
    /// Topic this binding's status is published on. For registered devices
    /// this is the device's own up-topic; for custom devices it is the
    /// agent's own up-topic.
    pub up_topic: String,
}

impl DeviceBinding {
    /// `true` once the agent has taken over this entry as its own installation.
    pub fn is_self(&self) -> bool {
        self.entry_name == "IoTAgent.py"
    }
}

/// Per-binding upgrade flags. `downloading` and `updating` are never both
/// true at once for the same binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindingState {
    pub downloading: bool,
    pub updating: bool,
    pub stop_requested: bool,
}

/// Latest heartbeat recorded for a managed program.
#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub program: String,
    pub timestamp: f64,
    pub reload_command: Option<String>,
}

/// A bind-set payload as carried by `agentDeviceAdd/Update/Delete` and the
/// fleet bootstrap response. Loosely typed to mirror the wire shape.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDevicePayload {
    #[serde(rename = "isCustomDevice", default)]
    pub is_custom_device: bool,
    pub directory: Option<String>,
    #[serde(rename = "entryName")]
    pub entry_name: Option<String>,
    #[serde(rename = "condaEnv")]
    pub conda_env: Option<String>,
    #[serde(rename = "startCommand")]
    pub start_command: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

/// A control message as it arrives on the down-topic. The legacy protocol
/// dispatches on the `type` string while overloading a handful of optional
/// fields across several logical commands, so this is deserialized loosely
/// rather than as a clean tagged enum; [`InboundMessage::classify`] produces
/// a structured command.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
    pub md5: Option<String>,
    pub stop: Option<bool>,
    #[serde(rename = "startUpdate")]
    pub start_update: Option<bool>,
    pub path: Option<String>,
    pub filename: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "processPath")]
    pub process_path: Option<String>,
    pub entry: Option<String>,
    #[serde(rename = "condaEnv")]
    pub conda_env: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    #[serde(rename = "agentDevice")]
    pub agent_device: Option<AgentDevicePayload>,
    pub directory: Option<String>,
    #[serde(rename = "entryName")]
    pub entry_name: Option<String>,
    #[serde(rename = "startCommand")]
    pub start_command: Option<String>,
    #[serde(rename = "isCustomDevice")]
    pub is_custom_device: Option<bool>,
}

/// A structured view of an inbound message's intent, produced by
/// [`InboundMessage::classify`].
#[derive(Debug, Clone)]
pub enum UpgradeCommand {
    Download {
        url: String,
        md5: Option<String>,
        process_path: Option<String>,
        entry: Option<String>,
        conda_env: Option<String>,
    },
    Stop {
        process_path: Option<String>,
        entry: Option<String>,
        conda_env: Option<String>,
    },
    StartUpdate {
        path: String,
        filename: Option<String>,
        version: String,
        process_path: Option<String>,
        entry: Option<String>,
        conda_env: Option<String>,
    },
    AgentDeviceAdd(AgentDevicePayload),
    AgentDeviceUpdate(AgentDevicePayload),
    AgentDeviceDelete(AgentDevicePayload),
    Restart {
        directory: String,
        entry_name: String,
        conda_env: Option<String>,
        start_command: Option<String>,
    },
    Unknown,
}

impl InboundMessage {
    /// Classify this message the way the legacy dispatcher does: `type ==
    /// "OTA"` carries mutually exclusive `url`/`stop`/`startUpdate` fields;
    /// any `type` *containing* `"agentDevice"` (substring, not equality —
    /// preserved intentionally) is a bind-set mutation; `type == "restart"`
    /// is a one-shot restart.
    pub fn classify(&self) -> UpgradeCommand {
        if self.kind == "OTA" {
            if let Some(url) = &self.url {
                return UpgradeCommand::Download {
                    url: url.clone(),
                    md5: self.md5.clone(),
                    process_path: self.process_path.clone(),
                    entry: self.entry.clone(),
                    conda_env: self.conda_env.clone(),
                };
            }
            if self.stop.unwrap_or(false) {
                return UpgradeCommand::Stop {
                    process_path: self.process_path.clone(),
                    entry: self.entry.clone(),
                    conda_env: self.conda_env.clone(),
                };
            }
            if self.start_update.unwrap_or(false) {
                if let (Some(path), Some(version)) = (&self.path, &self.version) {
                    return UpgradeCommand::StartUpdate {
                        path: path.clone(),
                        filename: self.filename.clone(),
                        version: version.clone(),
                        process_path: self.process_path.clone(),
                        entry: self.entry.clone(),
                        conda_env: self.conda_env.clone(),
                    };
                }
            }
            return UpgradeCommand::Unknown;
        }

        if self.kind.contains("agentDevice") {
            let payload = self.agent_device.clone().unwrap_or(AgentDevicePayload {
                is_custom_device: false,
                directory: None,
                entry_name: None,
                conda_env: None,
                start_command: None,
                device_id: None,
            });
            return match self.kind.as_str() {
                "agentDeviceAdd" => UpgradeCommand::AgentDeviceAdd(payload),
                "agentDeviceUpdate" => UpgradeCommand::AgentDeviceUpdate(payload),
                "agentDeviceDelete" => UpgradeCommand::AgentDeviceDelete(payload),
                _ => UpgradeCommand::Unknown,
            };
        }

        if self.kind == "restart" {
            if let (Some(directory), Some(entry_name)) = (&self.directory, &self.entry_name) {
                return UpgradeCommand::Restart {
                    directory: directory.clone(),
                    entry_name: entry_name.clone(),
                    conda_env: self.conda_env.clone(),
                    start_command: self.start_command.clone(),
                };
            }
        }

        UpgradeCommand::Unknown
    }
}

/// Status payload published back on a binding's up-topic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum UpgradeStatus {
    #[serde(rename = "downloading")]
    Downloading { timestamp: f64 },
    #[serde(rename = "download success")]
    DownloadSuccess { path: String, timestamp: f64 },
    #[serde(rename = "download failed")]
    DownloadFailed { error: String },
    #[serde(rename = "start update")]
    StartUpdate,
    #[serde(rename = "update success")]
    UpdateSuccess { version: String },
    #[serde(rename = "update failed")]
    UpdateFailed { error: String },
    #[serde(rename = "update stopped")]
    UpdateStopped,
}

/// The full envelope published on the wire: `{"type":"OTA", ...status}`.
#[derive(Debug, Clone, Serialize)]
pub struct OtaStatusMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub status: UpgradeStatus,
}

impl OtaStatusMessage {
    pub fn new(status: UpgradeStatus) -> Self {
        Self { kind: "OTA", status }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("UpgradeStatus always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_message(kind: &str) -> InboundMessage {
        InboundMessage {
            kind: kind.to_string(),
            url: None,
            md5: None,
            stop: None,
            start_update: None,
            path: None,
            filename: None,
            version: None,
            process_path: None,
            entry: None,
            conda_env: None,
            device_id: None,
            agent_device: None,
            directory: None,
            entry_name: None,
            start_command: None,
            is_custom_device: None,
        }
    }

    #[test]
    fn classifies_download() {
        let mut msg = base_message("OTA");
        msg.url = Some("http://h/a.zip".into());
        msg.md5 = Some("abc".into());
        assert!(matches!(msg.classify(), UpgradeCommand::Download { .. }));
    }

    #[test]
    fn classifies_stop() {
        let mut msg = base_message("OTA");
        msg.stop = Some(true);
        assert!(matches!(msg.classify(), UpgradeCommand::Stop { .. }));
    }

    #[test]
    fn classifies_start_update() {
        let mut msg = base_message("OTA");
        msg.start_update = Some(true);
        msg.path = Some("/downloads/a.zip".into());
        msg.version = Some("1.2.3".into());
        assert!(matches!(
            msg.classify(),
            UpgradeCommand::StartUpdate { .. }
        ));
    }

    #[test]
    fn start_update_carries_process_path_and_entry_for_self_targeting() {
        let mut msg = base_message("OTA");
        msg.start_update = Some(true);
        msg.path = Some("/downloads/a.zip".into());
        msg.version = Some("1.2.3".into());
        msg.process_path = Some("/opt/custom".into());
        msg.entry = Some("main.py".into());
        match msg.classify() {
            UpgradeCommand::StartUpdate {
                process_path, entry, ..
            } => {
                assert_eq!(process_path.as_deref(), Some("/opt/custom"));
                assert_eq!(entry.as_deref(), Some("main.py"));
            }
            other => panic!("expected StartUpdate, got {other:?}"),
        }
    }

    #[test]
    fn agent_device_type_matches_by_substring() {
        // Preserved legacy quirk: containment, not equality.
        let msg = base_message("xxagentDeviceAddxx");
        assert!(matches!(msg.classify(), UpgradeCommand::Unknown));
        let msg = base_message("agentDeviceAdd");
        assert!(matches!(msg.classify(), UpgradeCommand::AgentDeviceAdd(_)));
    }

    #[test]
    fn restart_requires_directory_and_entry_name() {
        let mut msg = base_message("restart");
        msg.directory = Some("/opt/app".into());
        msg.entry_name = Some("main.py".into());
        assert!(matches!(msg.classify(), UpgradeCommand::Restart { .. }));
    }

    #[test]
    fn status_message_serializes_with_flattened_tag() {
        let msg = OtaStatusMessage::new(UpgradeStatus::UpdateSuccess {
            version: "1.2.3".into(),
        });
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"OTA\""));
        assert!(json.contains("\"status\":\"update success\""));
        assert!(json.contains("\"version\":\"1.2.3\""));
    }

    #[test]
    fn is_self_matches_agent_entry_name() {
        let binding = DeviceBinding {
            key: "k".into(),
            is_custom: true,
            directory: "/opt".into(),
            entry_name: "IoTAgent.py".into(),
            conda_env: None,
            start_command: None,
            up_topic: "/devices/a/sys/messages/up".into(),
        };
        assert!(binding.is_self());
    }
}
