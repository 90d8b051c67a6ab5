//! MQTT transport: a thin wrapper per broker providing `connected`,
//! `subscribe`/`unsubscribe`, and `publish`, plus a background online
//! beacon. Two instances are kept side by side (primary control broker and
//! telemetry broker) — see [`crate::agent::Agent`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_core::config::BrokerConfig;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

const INITIAL_CONNECT_RETRIES: u32 = 3;
const AUTO_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(32);

pub struct Transport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    inbound: broadcast::Sender<Publish>,
}

impl Transport {
    /// Connect to `config`, retrying the initial handshake with exponential
    /// backoff, and spawn a background event loop that drives
    /// auto-reconnect with capped exponential backoff on disconnect.
    pub async fn connect(client_id: &str, config: &BrokerConfig, keepalive_secs: u64) -> anyhow::Result<Self> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(keepalive_secs));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    info!(host = %config.host, port = config.port, "connected to broker");
                    break;
                }
                Ok(_) => continue,
                Err(err) if attempt < INITIAL_CONNECT_RETRIES => {
                    let delay = Duration::from_secs(1 << (attempt - 1));
                    warn!(attempt, %err, delay_secs = delay.as_secs(), "initial connect failed, retrying");
                    sleep(delay).await;
                }
                Err(err) => {
                    anyhow::bail!("failed to connect to {}:{} after {} attempts: {err}", config.host, config.port, INITIAL_CONNECT_RETRIES);
                }
            }
        }

        let (inbound, _) = broadcast::channel(256);

        let loop_connected = connected.clone();
        let loop_inbound = inbound.clone();
        tokio::spawn(async move {
            let mut reconnect_attempt = 0u32;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        loop_connected.store(true, Ordering::SeqCst);
                        reconnect_attempt = 0;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        loop_connected.store(false, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = loop_inbound.send(publish);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        loop_connected.store(false, Ordering::SeqCst);
                        reconnect_attempt += 1;
                        if reconnect_attempt > AUTO_RECONNECT_ATTEMPTS {
                            warn!(%err, "auto-reconnect exhausted, waiting for next poll cycle");
                            reconnect_attempt = 0;
                        }
                        let delay = Duration::from_secs(2u64.saturating_pow(reconnect_attempt))
                            .min(RECONNECT_BACKOFF_CAP);
                        warn!(%err, delay_secs = delay.as_secs(), "broker connection dropped, reconnecting");
                        sleep(delay).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            connected,
            inbound,
        })
    }

    /// Subscribe to this transport's stream of inbound publishes.
    pub fn inbound(&self) -> broadcast::Receiver<Publish> {
        self.inbound.subscribe()
    }

    /// Liveness probe backing the public `connected()` state. A future
    /// keepalive ping failure flips this through the background event loop;
    /// this just reports the last-known state without blocking the caller.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        info!(topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.client.unsubscribe(topic).await?;
        info!(topic, "unsubscribed");
        Ok(())
    }

    /// Publish `payload` to `topic`. Returns whether the broker is currently
    /// believed connected — a `false` here means the message was dropped,
    /// matching the legacy `safe_publish`'s non-fatal failure policy.
    pub async fn publish(&self, topic: &str, payload: &str) -> bool {
        if !self.connected() {
            warn!(topic, "publish dropped, transport unavailable");
            return false;
        }
        match self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(topic, %err, "publish failed");
                false
            }
        }
    }

    /// Spawn the background online beacon: publishes `{"status":"online"}`
    /// to `up_topic` every `interval_secs`.
    pub fn spawn_online_beacon(self: &Arc<Self>, up_topic: String, interval_secs: u64) {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                transport.publish(&up_topic, r#"{"status":"online"}"#).await;
            }
        });
    }
}
