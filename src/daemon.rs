//! Gateway daemon
//!
//! Owns the registry and the transport event stream. Every inbound frame is
//! routed to its device's session task; the only work done on the dispatch
//! task itself is the hello handshake (authentication and session creation),
//! so one slow device can never stall another.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::{AuthProvider, OpenAuth, SharedSecretAuth};
use crate::config::Config;
use crate::ota::checkpoint::{self, CheckpointRepo};
use crate::ota::FirmwareImage;
use crate::pipeline::{Collaborators, providers};
use crate::protocol::{AudioParams, ControlIn, ControlOut, DeviceId, OtaIn, PROTOCOL_VERSION};
use crate::registry::Registry;
use crate::session::{self, SessionCommand, SessionContext};
use crate::transport::{AdminCommand, FramePublisher, TopicKind, Transport, TransportEvent};
use crate::Result;

/// Checkpoint database filename under the data directory
const CHECKPOINT_DB: &str = "ota-checkpoints.db";

/// The gateway process: transport, registry, and session supervision
pub struct Daemon {
    config: Config,
    collaborators: Collaborators,
    checkpoints: CheckpointRepo,
    firmware: Option<Arc<FirmwareImage>>,
    auth: Arc<dyn AuthProvider>,
    registry: Registry,
}

impl Daemon {
    /// Assemble the daemon from configuration
    ///
    /// Opens the checkpoint database (failing any transfer left in flight by
    /// a previous run) and loads the firmware image if one is configured.
    ///
    /// # Errors
    ///
    /// Returns error if collaborators cannot be built, the data directory or
    /// checkpoint database cannot be opened, or the firmware image cannot be
    /// read
    pub fn new(config: Config) -> Result<Self> {
        let collaborators = providers::build(&config.providers)?;

        let data_dir = config.resolve_data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let checkpoints = CheckpointRepo::new(checkpoint::init(data_dir.join(CHECKPOINT_DB))?);
        checkpoints.fail_in_flight()?;

        let firmware = match (&config.ota.firmware_path, &config.ota.firmware_version) {
            (Some(path), Some(version)) => {
                let image = FirmwareImage::load(path, version)?;
                tracing::info!(
                    version = %image.version,
                    size = image.size(),
                    sha256 = %image.sha256,
                    "firmware image loaded"
                );
                Some(Arc::new(image))
            }
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("firmware_path and firmware_version must both be set; ota disabled");
                None
            }
            (None, None) => None,
        };

        let auth: Arc<dyn AuthProvider> = config.device_secret.as_ref().map_or_else(
            || {
                tracing::warn!("no device secret configured, accepting any device token");
                Arc::new(OpenAuth) as Arc<dyn AuthProvider>
            },
            |secret| Arc::new(SharedSecretAuth::new(secret.clone())) as Arc<dyn AuthProvider>,
        );

        Ok(Self {
            config,
            collaborators,
            checkpoints,
            firmware,
            auth,
            registry: Registry::new(),
        })
    }

    /// Connect to the broker and dispatch until shutdown
    ///
    /// # Errors
    ///
    /// Returns error only on unrecoverable startup failure; broker loss is
    /// handled by suspending sessions and reconnecting
    pub async fn run(mut self) -> Result<()> {
        let (transport, events) = Transport::connect(&self.config.mqtt);
        let publisher: Arc<dyn FramePublisher> = Arc::new(transport);
        tracing::info!(
            host = %self.config.mqtt.host,
            port = self.config.mqtt.port,
            "gateway started"
        );

        self.dispatch_loop(events, &publisher).await;

        tracing::info!("shutting down");
        self.registry.shutdown_all().await;
        // give sessions a moment to emit their goodbye frames
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        Ok(())
    }

    async fn dispatch_loop(
        &mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        publisher: &Arc<dyn FramePublisher>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event, publisher).await,
                    None => return,
                },
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "signal handler failed");
                    }
                    return;
                }
            }
        }
    }

    async fn dispatch(&mut self, event: TransportEvent, publisher: &Arc<dyn FramePublisher>) {
        match event {
            TransportEvent::Frame {
                device,
                kind,
                payload,
            } => self.dispatch_frame(device, kind, payload, publisher).await,
            TransportEvent::Admin(AdminCommand::CancelOta { device, reason }) => {
                if let Some(handle) = self.registry.get(&device) {
                    handle
                        .send(SessionCommand::CancelOta {
                            reason: reason.unwrap_or_else(|| "cancelled by operator".to_string()),
                        })
                        .await;
                } else {
                    tracing::warn!(%device, "cancel for unknown device");
                }
            }
            TransportEvent::ConnectivityLost => {
                tracing::warn!("broker connectivity lost, suspending sessions");
                self.registry.suspend_all().await;
            }
            TransportEvent::ConnectivityRestored => {
                let pruned = self.registry.prune_closed();
                if pruned > 0 {
                    tracing::debug!(pruned, "pruned closed sessions");
                }
                self.registry.resume_all().await;
            }
        }
    }

    async fn dispatch_frame(
        &mut self,
        device: DeviceId,
        kind: TopicKind,
        payload: Vec<u8>,
        publisher: &Arc<dyn FramePublisher>,
    ) {
        match kind {
            TopicKind::AudioIn => {
                if let Some(handle) = self.registry.get(&device) {
                    handle.send(SessionCommand::Audio(payload)).await;
                } else {
                    tracing::debug!(%device, "audio from device with no session");
                }
            }
            TopicKind::ControlIn => match serde_json::from_slice::<ControlIn>(&payload) {
                Ok(ControlIn::Hello {
                    version,
                    token,
                    audio_params,
                    firmware_version,
                }) => {
                    self.handle_hello(device, version, &token, audio_params, firmware_version, publisher)
                        .await;
                }
                Ok(msg) => {
                    if let Some(handle) = self.registry.get(&device) {
                        handle.send(SessionCommand::Control(msg)).await;
                    } else {
                        tracing::debug!(%device, "control message from device with no session");
                    }
                }
                Err(e) => {
                    tracing::warn!(%device, error = %e, "malformed control message");
                }
            },
            TopicKind::OtaIn => match serde_json::from_slice::<OtaIn>(&payload) {
                Ok(msg) => {
                    if let Some(handle) = self.registry.get(&device) {
                        handle.send(SessionCommand::Ota(msg)).await;
                    } else {
                        tracing::debug!(%device, "ota message from device with no session");
                    }
                }
                Err(e) => {
                    tracing::warn!(%device, error = %e, "malformed ota message");
                }
            },
            TopicKind::AudioOut | TopicKind::ControlOut | TopicKind::OtaOut => {
                // we only subscribe to the /in topics; seeing our own output
                // means a misconfigured bridge
                tracing::debug!(%device, ?kind, "ignoring frame on outbound topic");
            }
        }
    }

    async fn handle_hello(
        &mut self,
        device: DeviceId,
        version: u32,
        token: &str,
        audio_params: Option<AudioParams>,
        firmware_version: Option<String>,
        publisher: &Arc<dyn FramePublisher>,
    ) {
        if version != PROTOCOL_VERSION {
            tracing::warn!(%device, version, "unsupported protocol version");
            let reply = ControlOut::Error {
                message: format!("unsupported protocol version {version}"),
            };
            if let Err(e) = publisher.send_control(&device, &reply).await {
                tracing::debug!(%device, error = %e, "version reject publish failed");
            }
            return;
        }

        if let Err(e) = self.auth.verify_device(&device, token).await {
            tracing::warn!(%device, error = %e, "authentication failed");
            let reply = ControlOut::Error {
                message: "authentication failed".to_string(),
            };
            if let Err(e) = publisher.send_control(&device, &reply).await {
                tracing::debug!(%device, error = %e, "auth reject publish failed");
            }
            return;
        }

        // same identity, live session: merge the new binding instead of
        // creating a duplicate
        if let Some(handle) = self.registry.get(&device) {
            tracing::info!(%device, session = %handle.session_id(), "device rebound to session");
            handle.send(SessionCommand::Rebind { audio_params }).await;
            self.offer_firmware(&device, firmware_version.as_deref()).await;
            return;
        }

        self.registry.prune_closed();
        let handle = session::spawn(SessionContext {
            device: device.clone(),
            audio_params: audio_params.unwrap_or_default(),
            session_config: self.config.session.clone(),
            segmenter_config: self.config.segmenter.clone(),
            ota_config: self.config.ota.clone(),
            collaborators: self.collaborators.clone(),
            publisher: Arc::clone(publisher),
            checkpoints: self.checkpoints.clone(),
        });
        self.registry.insert(handle);
        self.offer_firmware(&device, firmware_version.as_deref()).await;
    }

    /// Start an OTA job when the device is behind the configured firmware
    async fn offer_firmware(&self, device: &DeviceId, reported: Option<&str>) {
        let (Some(image), Some(reported)) = (&self.firmware, reported) else {
            return;
        };
        if reported == image.version {
            return;
        }
        let Some(handle) = self.registry.get(device) else {
            return;
        };
        tracing::info!(
            %device,
            running = reported,
            available = %image.version,
            "device firmware out of date"
        );
        handle.send(SessionCommand::StartOta(Arc::clone(image))).await;
    }
}
