//! A minimal, short-lived MQTT publisher for the self-upgrader: connect
//! once, publish status updates as they happen, and let the process exit
//! close the connection. No reconnect logic — a self-upgrade run is short
//! enough that a dropped broker connection should just surface as a dropped
//! status, not derail the upgrade.

use agent_core::config::BrokerConfig;
use agent_core::OtaStatusMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::warn;

pub struct StatusReporter {
    client: AsyncClient,
    up_topic: String,
}

impl StatusReporter {
    pub async fn connect(client_id: &str, broker: &BrokerConfig, up_topic: String) -> anyhow::Result<Self> {
        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 16);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(err) => anyhow::bail!("self-upgrader failed to connect to broker: {err}"),
            }
        }

        tokio::spawn(async move { while eventloop.poll().await.is_ok() {} });

        Ok(Self { client, up_topic })
    }

    pub async fn publish(&self, message: OtaStatusMessage) {
        if let Err(err) = self
            .client
            .publish(&self.up_topic, QoS::AtLeastOnce, false, message.to_json())
            .await
        {
            warn!(%err, "failed to publish self-upgrade status");
        }
    }
}
