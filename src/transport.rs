//! MQTT transport adapter
//!
//! Maps the broker's topic namespace to device identities and back, delivers
//! inbound frames to the daemon, and publishes outbound frames at QoS 1
//! (at-least-once). The adapter never deduplicates; consumers detect
//! duplicates via sequence numbers.
//!
//! Topic namespace: `device/{id}/{audio|control|ota}/{in|out}`, plus the
//! `ember/admin` operator topic.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::MqttConfig;
use crate::protocol::{ControlOut, DeviceId, OtaOut, ResponseFrame};
use crate::{Error, Result};

/// Operator topic for administrative commands
const ADMIN_TOPIC: &str = "ember/admin";

/// Reconnect backoff bounds
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Topic kinds in the device namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `device/{id}/audio/in` — binary PCM frames from the microphone
    AudioIn,
    /// `device/{id}/audio/out` — binary synthesized response frames
    AudioOut,
    /// `device/{id}/control/in` — JSON control messages from the device
    ControlIn,
    /// `device/{id}/control/out` — JSON control messages to the device
    ControlOut,
    /// `device/{id}/ota/in` — JSON OTA acknowledgments from the device
    OtaIn,
    /// `device/{id}/ota/out` — JSON OTA offers and chunks to the device
    OtaOut,
}

impl TopicKind {
    const fn suffix(self) -> &'static str {
        match self {
            Self::AudioIn => "audio/in",
            Self::AudioOut => "audio/out",
            Self::ControlIn => "control/in",
            Self::ControlOut => "control/out",
            Self::OtaIn => "ota/in",
            Self::OtaOut => "ota/out",
        }
    }
}

/// Administrative commands published on [`ADMIN_TOPIC`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Cancel the active OTA job for a device
    CancelOta {
        /// Target device
        device: DeviceId,
        /// Reason recorded in the checkpoint and sent to the device
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Events surfaced to the daemon dispatch loop
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound frame on a device topic
    Frame {
        /// Device the topic is scoped to
        device: DeviceId,
        /// Which topic the frame arrived on
        kind: TopicKind,
        /// Raw payload
        payload: Vec<u8>,
    },
    /// An operator command
    Admin(AdminCommand),
    /// Broker connection lost; sessions should suspend, not tear down
    ConnectivityLost,
    /// Broker connection (re)established and subscriptions restored
    ConnectivityRestored,
}

/// Build the full topic for a device and kind
#[must_use]
pub fn topic_for(device: &DeviceId, kind: TopicKind) -> String {
    format!("device/{device}/{}", kind.suffix())
}

/// Parse an inbound topic into its device identity and kind
///
/// # Errors
///
/// Returns [`Error::Transport`] for topics outside the device namespace.
pub fn parse_topic(topic: &str) -> Result<(DeviceId, TopicKind)> {
    let parts: Vec<&str> = topic.split('/').collect();
    let [scope, id, ns, dir] = parts.as_slice() else {
        return Err(Error::Transport(format!("malformed topic: {topic}")));
    };
    if *scope != "device" || id.is_empty() {
        return Err(Error::Transport(format!("malformed topic: {topic}")));
    }
    let kind = match (*ns, *dir) {
        ("audio", "in") => TopicKind::AudioIn,
        ("audio", "out") => TopicKind::AudioOut,
        ("control", "in") => TopicKind::ControlIn,
        ("control", "out") => TopicKind::ControlOut,
        ("ota", "in") => TopicKind::OtaIn,
        ("ota", "out") => TopicKind::OtaOut,
        _ => return Err(Error::Transport(format!("malformed topic: {topic}"))),
    };
    Ok((DeviceId::from(*id), kind))
}

/// Outbound publishing seam shared by sessions and OTA jobs
///
/// [`Transport`] is the broker-backed implementation; tests substitute a
/// channel-backed publisher to observe outbound traffic.
#[async_trait]
pub trait FramePublisher: Send + Sync {
    /// Publish a raw payload to a device topic at QoS 1
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the payload cannot be delivered to the
    /// client request queue.
    async fn publish(&self, device: &DeviceId, kind: TopicKind, payload: Vec<u8>) -> Result<()>;

    /// Publish a control message to `device/{id}/control/out`
    ///
    /// # Errors
    ///
    /// Returns error if serialization or publishing fails
    async fn send_control(&self, device: &DeviceId, msg: &ControlOut) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.publish(device, TopicKind::ControlOut, payload).await
    }

    /// Publish a response audio frame to `device/{id}/audio/out`
    ///
    /// # Errors
    ///
    /// Returns error if publishing fails
    async fn send_response(&self, device: &DeviceId, frame: &ResponseFrame) -> Result<()> {
        self.publish(device, TopicKind::AudioOut, frame.encode()).await
    }

    /// Publish an OTA message to `device/{id}/ota/out`
    ///
    /// # Errors
    ///
    /// Returns error if serialization or publishing fails
    async fn send_ota(&self, device: &DeviceId, msg: &OtaOut) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.publish(device, TopicKind::OtaOut, payload).await
    }
}

/// Cloneable handle for publishing outbound frames
#[derive(Clone)]
pub struct Transport {
    client: AsyncClient,
}

impl Transport {
    /// Connect to the broker and spawn the event loop task
    ///
    /// Returns the publish handle and the inbound event stream. The event
    /// loop reconnects with exponential backoff, re-subscribing and emitting
    /// [`TransportEvent::ConnectivityRestored`] on every successful connect.
    #[must_use]
    pub fn connect(config: &MqttConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(256);

        let subscriber = client.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_BASE;
            let mut connected = false;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff = BACKOFF_BASE;
                        connected = true;
                        if let Err(e) = resubscribe(&subscriber).await {
                            tracing::error!(error = %e, "subscription failed after connect");
                        }
                        tracing::info!("connected to MQTT broker");
                        if tx.send(TransportEvent::ConnectivityRestored).await.is_err() {
                            return;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = match parse_topic(&publish.topic) {
                            Ok((device, kind)) => TransportEvent::Frame {
                                device,
                                kind,
                                payload: publish.payload.to_vec(),
                            },
                            Err(_) if publish.topic == ADMIN_TOPIC => {
                                match serde_json::from_slice::<AdminCommand>(&publish.payload) {
                                    Ok(cmd) => TransportEvent::Admin(cmd),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "invalid admin command");
                                        continue;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(topic = %publish.topic, error = %e, "ignoring frame");
                                continue;
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected {
                            connected = false;
                            tracing::warn!(error = %e, "broker connection lost");
                            if tx.send(TransportEvent::ConnectivityLost).await.is_err() {
                                return;
                            }
                        } else {
                            tracing::debug!(error = %e, backoff = ?backoff, "broker unreachable");
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        });

        (Self { client }, rx)
    }
}

#[async_trait]
impl FramePublisher for Transport {
    async fn publish(&self, device: &DeviceId, kind: TopicKind, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic_for(device, kind), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Restore the gateway's subscriptions after a (re)connect
async fn resubscribe(client: &AsyncClient) -> Result<()> {
    for pattern in [
        "device/+/audio/in",
        "device/+/control/in",
        "device/+/ota/in",
        ADMIN_TOPIC,
    ] {
        client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
    }
    Ok(())
}
