//! Construction root: wires the transports, registry, OTA engine, control
//! plane and heartbeat watcher into a single runnable agent. Mirrors the
//! reference daemon's `AppState` aggregate, replacing its scanner/mcumgr
//! wiring with the OTA agent's own components.

use std::path::PathBuf;
use std::sync::Arc;

use agent_core::config::Config;
use agent_core::DeviceBinding;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::{info, warn};

use crate::control_plane::ControlPlane;
use crate::downloader::Downloader;
use crate::heartbeat::HeartbeatWatcher;
use crate::http_client::HttpClient;
use crate::ota::OtaEngine;
use crate::registry::DeviceRegistry;
use crate::transport::Transport;

pub struct Agent {
    config: Config,
    agent_id: String,
    registry: Arc<DeviceRegistry>,
    primary: Arc<Transport>,
    telemetry: Arc<Transport>,
    control_plane: Arc<ControlPlane>,
    heartbeat: Arc<HeartbeatWatcher>,
    heartbeat_topic: Option<String>,
}

impl Agent {
    pub async fn bootstrap(
        config: Config,
        selfupgrade_binary: PathBuf,
        config_path: PathBuf,
    ) -> anyhow::Result<Self> {
        let mac = resolve_mac_address(&config.identity.interface)
            .unwrap_or_else(|| "unknown-mac".to_string());
        let agent_id = format!("{}_{}_agent", config.identity.product_agent_id, mac);
        info!(agent_id, "resolved agent identity");

        let registry = DeviceRegistry::new();

        let http = HttpClient::new(&config.http)?;
        let bindings = http.fetch_agent_devices(&agent_id).await;
        registry.bootstrap(bindings).await;
        info!(count = registry.len().await, "loaded fleet bindings");

        let heartbeat_topic = http.resolve_robot_code(&mac).await.map(|robot_code| {
            info!(robot_code, "resolved robot code for heartbeat topic");
            format!("/robot/{robot_code}/heartbeat")
        });
        if heartbeat_topic.is_none() {
            warn!("no robot code resolved, heartbeat watchdog will not receive beats");
        }

        let primary = Arc::new(
            Transport::connect(&agent_id, &config.transport.primary, config.transport.keepalive_secs)
                .await?,
        );
        let telemetry = Arc::new(
            Transport::connect(
                &format!("{agent_id}-telemetry"),
                &config.transport.telemetry,
                config.transport.keepalive_secs,
            )
            .await?,
        );

        let downloader = Arc::new(Downloader::new(&config.paths.downloads_dir)?);
        let ota = OtaEngine::new(
            registry.clone(),
            downloader,
            primary.clone(),
            PathBuf::from(&config.paths.agent_dir),
            config.paths.max_backup_count,
            selfupgrade_binary,
            config_path,
        );

        let control_plane = Arc::new(ControlPlane::new(
            registry.clone(),
            ota,
            primary.clone(),
            agent_id.clone(),
        ));

        let heartbeat = HeartbeatWatcher::with_default_timeout();

        Ok(Self {
            config,
            agent_id,
            registry,
            primary,
            telemetry,
            control_plane,
            heartbeat,
            heartbeat_topic,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Subscribe to every known binding's topic plus the agent's own, start
    /// the online beacons and heartbeat sweep, then run the dispatch loop
    /// forever.
    pub async fn run(self) -> anyhow::Result<()> {
        self.subscribe_all().await;

        self.primary
            .spawn_online_beacon(self.up_topic(&self.agent_id), self.config.transport.online_beacon_secs);
        self.telemetry
            .spawn_online_beacon(self.up_topic(&self.agent_id), self.config.transport.online_beacon_secs);
        self.heartbeat.spawn_sweep();

        self.spawn_dispatch(self.primary.clone());
        self.spawn_heartbeat_dispatch();

        std::future::pending::<()>().await;
        Ok(())
    }

    fn spawn_dispatch(&self, transport: Arc<Transport>) {
        let control_plane = self.control_plane.clone();
        let mut inbound = transport.inbound();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(publish) => control_plane.handle_publish(publish).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatch loop lagged, dropped inbound messages");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Consume the telemetry transport's inbound stream as heartbeat beats
    /// rather than control-plane commands: the telemetry broker carries only
    /// the robot-scoped heartbeat topic.
    fn spawn_heartbeat_dispatch(&self) {
        let heartbeat = self.heartbeat.clone();
        let mut inbound = self.telemetry.inbound();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(publish) => match serde_json::from_slice(&publish.payload) {
                        Ok(beat) => heartbeat.record(beat).await,
                        Err(err) => warn!(%err, "dropped unparseable heartbeat payload"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "heartbeat dispatch lagged, dropped beats");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn subscribe_all(&self) {
        let own_down = self.down_topic(&self.agent_id);
        if let Err(err) = self.primary.subscribe(&own_down).await {
            warn!(%err, "failed to subscribe to own down topic");
        }

        if let Some(topic) = &self.heartbeat_topic {
            if let Err(err) = self.telemetry.subscribe(topic).await {
                warn!(%err, "failed to subscribe to heartbeat topic");
            }
        }

        for binding in self.registry.all().await {
            if binding.is_custom {
                continue;
            }
            let topic = down_topic_for(&binding);
            if let Err(err) = self.primary.subscribe(&topic).await {
                warn!(%err, "failed to subscribe to bootstrapped binding topic");
            }
        }

        let mut events = self.registry.subscribe();
        tokio::spawn({
            let primary = self.primary.clone();
            async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        crate::registry::RegistryEvent::Added(binding)
                        | crate::registry::RegistryEvent::Updated(binding) => {
                            if binding.is_custom {
                                continue;
                            }
                            let topic = down_topic_for(&binding);
                            if let Err(err) = primary.subscribe(&topic).await {
                                warn!(%err, "failed to subscribe to binding topic");
                            }
                        }
                        crate::registry::RegistryEvent::Removed(binding) => {
                            if binding.is_custom {
                                continue;
                            }
                            let topic = down_topic_for(&binding);
                            if let Err(err) = primary.unsubscribe(&topic).await {
                                warn!(%err, "failed to unsubscribe from binding topic");
                            }
                        }
                    }
                }
            }
        });
    }

    fn up_topic(&self, id: &str) -> String {
        format!("/devices/{id}/sys/messages/up")
    }

    fn down_topic(&self, id: &str) -> String {
        format!("/devices/{id}/sys/messages/down")
    }
}

fn down_topic_for(binding: &DeviceBinding) -> String {
    format!("/devices/{}/sys/messages/down", binding.key)
}

fn resolve_mac_address(interface_name: &str) -> Option<String> {
    let interfaces = NetworkInterface::show().ok()?;
    interfaces
        .into_iter()
        .find(|iface| iface.name == interface_name)
        .and_then(|iface| iface.mac_addr)
}
