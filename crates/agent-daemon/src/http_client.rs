//! HTTP bootstrap client: fetches the fleet's registered device bindings and
//! resolves the robot/product code for this agent's MAC address. Mirrors the
//! legacy `HttpTool`'s retrying `requests.Session`, adapted to
//! `reqwest`'s built-in per-request timeout plus a manual retry loop (the
//! legacy retry is transport-level `urllib3.Retry`, which `reqwest` has no
//! direct equivalent for).

use agent_core::config::HttpConfig;
use agent_core::{AgentDevicePayload, DeviceBinding};
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    retries: u32,
}

#[derive(Debug, Deserialize)]
struct AgentDevicesResponse {
    #[serde(default)]
    data: Vec<AgentDevicePayload>,
}

#[derive(Debug, Deserialize)]
struct RobotListResponse {
    #[serde(default)]
    data: RobotListData,
}

#[derive(Debug, Default, Deserialize)]
struct RobotListData {
    #[serde(default)]
    list: Vec<RobotEntry>,
}

#[derive(Debug, Deserialize)]
struct RobotEntry {
    #[serde(rename = "robotCode")]
    robot_code: String,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            retries: config.retries,
        })
    }

    /// Fetch this agent's registered device bindings. On repeated failure,
    /// logs and returns an empty list so the daemon still starts with
    /// whatever custom bindings arrive over MQTT later.
    pub async fn fetch_agent_devices(&self, agent_device_id: &str) -> Vec<DeviceBinding> {
        let url = format!(
            "{}/api/agentDevices?agentDeviceId={}",
            self.base_url, agent_device_id
        );
        match self.get_with_retry::<AgentDevicesResponse>(&url).await {
            Ok(response) => response
                .data
                .into_iter()
                .map(|payload| to_binding(agent_device_id, payload))
                .collect(),
            Err(err) => {
                warn!(%err, "failed to fetch fleet bindings, starting with an empty registry");
                Vec::new()
            }
        }
    }

    /// Resolve the robot/product code registered for `robot_mac`, if any.
    pub async fn resolve_robot_code(&self, robot_mac: &str) -> Option<String> {
        let url = format!(
            "{}/robot/list?robotMac={}&pageNum=1&pageSize=10",
            self.base_url, robot_mac
        );
        match self.get_with_retry::<RobotListResponse>(&url).await {
            Ok(response) => response.data.list.into_iter().next().map(|e| e.robot_code),
            Err(err) => {
                warn!(%err, "failed to resolve robot code");
                None
            }
        }
    }

    async fn get_with_retry<T: for<'de> Deserialize<'de>>(&self, url: &str) -> reqwest::Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => return response.json::<T>().await,
                Err(err) if attempt <= self.retries => {
                    let delay = Duration::from_millis(300 * attempt as u64);
                    warn!(url, attempt, %err, "http request failed, retrying");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn to_binding(agent_device_id: &str, payload: AgentDevicePayload) -> DeviceBinding {
    let key = payload
        .device_id
        .clone()
        .unwrap_or_else(|| agent_device_id.to_string());
    let up_topic = format!("/devices/{key}/sys/messages/up");
    info!(key, "loaded fleet binding");
    DeviceBinding {
        key,
        is_custom: payload.is_custom_device,
        directory: payload.directory.unwrap_or_default(),
        entry_name: payload.entry_name.unwrap_or_default(),
        conda_env: payload.conda_env,
        start_command: payload.start_command,
        up_topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_derives_up_topic_from_device_id() {
        let payload = AgentDevicePayload {
            is_custom_device: false,
            directory: Some("/opt/app".into()),
            entry_name: Some("main.py".into()),
            conda_env: None,
            start_command: None,
            device_id: Some("D1".into()),
        };
        let binding = to_binding("agent-1", payload);
        assert_eq!(binding.key, "D1");
        assert_eq!(binding.up_topic, "/devices/D1/sys/messages/up");
    }

    #[test]
    fn binding_falls_back_to_agent_id_when_device_id_absent() {
        let payload = AgentDevicePayload {
            is_custom_device: false,
            directory: None,
            entry_name: None,
            conda_env: None,
            start_command: None,
            device_id: None,
        };
        let binding = to_binding("agent-1", payload);
        assert_eq!(binding.key, "agent-1");
    }
}
