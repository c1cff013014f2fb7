//! Over-the-air firmware delivery
//!
//! One job per device at a time. The transfer is stop-and-wait: chunks are
//! base64-encoded into JSON on `device/{id}/ota/out` and the next chunk is
//! only sent once the previous one is acknowledged, so a slow flash write
//! throttles the stream instead of overflowing the device. Every ack and
//! state transition is checkpointed through [`checkpoint::CheckpointRepo`].
//!
//! While a job is in [`OtaState::Transferring`] or [`OtaState::Verifying`]
//! the owning session holds live capture; the session learns the boundaries
//! from [`OtaEvent::StateChanged`].

pub mod checkpoint;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::OtaConfig;
use crate::protocol::{DeviceId, OtaIn, OtaOut};
use crate::transport::FramePublisher;
use crate::{Error, Result};
use checkpoint::{CheckpointRepo, OtaCheckpoint};

/// How long a device gets to accept an offer
const OFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a device gets to flash and confirm after the last chunk
const APPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    /// Offer published, waiting for the device to accept
    Offered,
    /// Device accepted; transfer about to begin
    Accepted,
    /// Chunks in flight
    Transferring,
    /// All chunks acknowledged; device flashing and verifying
    Verifying,
    /// Device confirmed the new image
    Applied,
    /// Job failed (retry exhaustion, device error, or lost session)
    Failed,
    /// Job cancelled by an operator
    Cancelled,
}

impl OtaState {
    /// Stable string form used in checkpoints and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the checkpoint string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offered" => Some(Self::Offered),
            "accepted" => Some(Self::Accepted),
            "transferring" => Some(Self::Transferring),
            "verifying" => Some(Self::Verifying),
            "applied" => Some(Self::Applied),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the job can make no further progress
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Cancelled)
    }

    /// Whether the owning session must hold live capture in this state
    #[must_use]
    pub const fn holds_session(self) -> bool {
        matches!(self, Self::Transferring | Self::Verifying)
    }
}

impl std::fmt::Display for OtaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A firmware image loaded into memory, ready to offer
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// Version this image carries
    pub version: String,
    /// Hex-encoded SHA-256 of the full image
    pub sha256: String,
    bytes: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from disk and compute its digest
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn load<P: AsRef<Path>>(path: P, version: impl Into<String>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(version, bytes))
    }

    /// Build an image from in-memory bytes
    #[must_use]
    pub fn from_bytes(version: impl Into<String>, bytes: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Self {
            version: version.into(),
            sha256,
            bytes,
        }
    }

    /// Total image size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Number of chunks at the given payload size
    #[must_use]
    pub fn chunk_count(&self, chunk_size: u32) -> u32 {
        u32::try_from(self.bytes.len().div_ceil(chunk_size.max(1) as usize)).unwrap_or(u32::MAX)
    }

    /// The bytes of chunk `index`; the last chunk may be short
    #[must_use]
    pub fn chunk(&self, index: u32, chunk_size: u32) -> &[u8] {
        let size = chunk_size.max(1) as usize;
        let start = (index as usize).saturating_mul(size).min(self.bytes.len());
        let end = start.saturating_add(size).min(self.bytes.len());
        &self.bytes[start..end]
    }
}

/// Notifications from a job to its owning session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaEvent {
    /// The job moved to a new state
    StateChanged(OtaState),
}

/// Out-of-band directives to a running job
#[derive(Debug)]
enum JobSignal {
    /// Operator requested cancellation
    Cancel(String),
    /// The owning session is tearing down
    SessionClosed,
}

/// Handle to a spawned job, held by the owning session
#[derive(Debug)]
pub struct OtaJob {
    job_id: String,
    version: String,
    msg_tx: mpsc::Sender<OtaIn>,
    signal_tx: mpsc::Sender<JobSignal>,
}

impl OtaJob {
    /// Spawn the job task for `device` and return its handle
    ///
    /// The task drives the offer / transfer / verify sequence on its own;
    /// the session forwards device messages via [`OtaJob::deliver`] and
    /// watches `events` for hold boundaries and completion.
    #[must_use]
    pub fn spawn(
        device: DeviceId,
        image: Arc<FirmwareImage>,
        config: OtaConfig,
        publisher: Arc<dyn FramePublisher>,
        repo: CheckpointRepo,
        events: mpsc::Sender<OtaEvent>,
    ) -> Self {
        let job_id = Uuid::new_v4().to_string();
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (signal_tx, signal_rx) = mpsc::channel(4);

        let runner = JobRunner {
            device,
            job_id: job_id.clone(),
            image: Arc::clone(&image),
            config,
            publisher,
            repo,
            msg_rx,
            signal_rx,
            events,
            bytes_acked: 0,
            state: OtaState::Offered,
        };
        tokio::spawn(runner.run());

        Self {
            job_id,
            version: image.version.clone(),
            msg_tx,
            signal_tx,
        }
    }

    /// The server-assigned job id
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The firmware version this job delivers
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Forward a device OTA message to the job task
    pub async fn deliver(&self, msg: OtaIn) {
        if self.msg_tx.send(msg).await.is_err() {
            tracing::debug!(job_id = %self.job_id, "ota message for finished job dropped");
        }
    }

    /// Cancel the job on behalf of an operator
    pub async fn cancel(&self, reason: String) {
        let _ = self.signal_tx.send(JobSignal::Cancel(reason)).await;
    }

    /// Tell the job its session is gone; the job fails but keeps its checkpoint
    pub fn session_closed(&self) {
        let _ = self.signal_tx.try_send(JobSignal::SessionClosed);
    }
}

/// Why `drive` stopped early
enum JobEnd {
    Cancelled(String),
    Failed {
        reason: String,
        /// Whether the device is still listening and should be told
        notify_device: bool,
    },
}

/// What arrived while waiting on the device
enum Waited {
    Device(OtaIn),
    Cancel(String),
    SessionClosed,
    TimedOut,
}

struct JobRunner {
    device: DeviceId,
    job_id: String,
    image: Arc<FirmwareImage>,
    config: OtaConfig,
    publisher: Arc<dyn FramePublisher>,
    repo: CheckpointRepo,
    msg_rx: mpsc::Receiver<OtaIn>,
    signal_rx: mpsc::Receiver<JobSignal>,
    events: mpsc::Sender<OtaEvent>,
    bytes_acked: u64,
    state: OtaState,
}

impl JobRunner {
    async fn run(mut self) {
        tracing::info!(
            device = %self.device,
            job_id = %self.job_id,
            version = %self.image.version,
            size = self.image.size(),
            "starting ota job"
        );
        match self.drive().await {
            Ok(()) => {}
            Err(JobEnd::Cancelled(reason)) => {
                tracing::info!(device = %self.device, job_id = %self.job_id, %reason, "ota job cancelled");
                self.notify_device(&reason).await;
                self.set_state(OtaState::Cancelled).await;
            }
            Err(JobEnd::Failed {
                reason,
                notify_device,
            }) => {
                tracing::warn!(device = %self.device, job_id = %self.job_id, %reason, "ota job failed");
                if notify_device {
                    self.notify_device(&reason).await;
                }
                self.set_state(OtaState::Failed).await;
            }
        }
    }

    async fn drive(&mut self) -> std::result::Result<(), JobEnd> {
        self.set_state(OtaState::Offered).await;
        self.send(&OtaOut::Offer {
            job_id: self.job_id.clone(),
            version: self.image.version.clone(),
            size: self.image.size(),
            sha256: self.image.sha256.clone(),
            chunk_size: self.config.chunk_size,
        })
        .await?;
        self.wait_accept().await?;

        self.set_state(OtaState::Accepted).await;
        self.set_state(OtaState::Transferring).await;

        let chunk_count = self.image.chunk_count(self.config.chunk_size);
        for index in 0..chunk_count {
            let chunk = self.image.chunk(index, self.config.chunk_size).to_vec();
            self.deliver_chunk(index, &chunk).await?;
            self.bytes_acked += chunk.len() as u64;
            self.checkpoint();
        }

        self.set_state(OtaState::Verifying).await;
        self.wait_applied().await?;
        self.set_state(OtaState::Applied).await;
        tracing::info!(device = %self.device, job_id = %self.job_id, "ota job applied");
        Ok(())
    }

    /// Wait for the device to accept the offer
    async fn wait_accept(&mut self) -> std::result::Result<(), JobEnd> {
        loop {
            match self.next(OFFER_TIMEOUT).await {
                Waited::Device(OtaIn::Accept { job_id }) if job_id == self.job_id => {
                    return Ok(());
                }
                Waited::Device(OtaIn::Failed { reason, .. }) => {
                    return Err(JobEnd::Failed {
                        reason,
                        notify_device: false,
                    });
                }
                Waited::Device(other) => {
                    tracing::debug!(job_id = %self.job_id, msg = ?other, "ignoring stray ota message");
                }
                Waited::Cancel(reason) => return Err(JobEnd::Cancelled(reason)),
                Waited::SessionClosed => {
                    return Err(JobEnd::Failed {
                        reason: "session closed before transfer".to_string(),
                        notify_device: false,
                    });
                }
                Waited::TimedOut => {
                    return Err(JobEnd::Failed {
                        reason: "device did not accept the offer".to_string(),
                        notify_device: true,
                    });
                }
            }
        }
    }

    /// Send one chunk and wait for its acknowledgment, retransmitting on
    /// timeout up to the configured retry limit
    async fn deliver_chunk(
        &mut self,
        index: u32,
        chunk: &[u8],
    ) -> std::result::Result<(), JobEnd> {
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let attempts = self.config.max_chunk_retries + 1;
        let msg = OtaOut::Chunk {
            job_id: self.job_id.clone(),
            index,
            data: BASE64.encode(chunk),
        };

        for attempt in 1..=attempts {
            self.send(&msg).await?;
            loop {
                match self.next(ack_timeout).await {
                    Waited::Device(OtaIn::ChunkAck {
                        job_id,
                        index: acked,
                    }) if job_id == self.job_id => {
                        if acked == index {
                            return Ok(());
                        }
                        // at-least-once delivery re-acks old chunks
                        tracing::debug!(job_id = %self.job_id, acked, index, "duplicate chunk ack");
                    }
                    Waited::Device(OtaIn::Failed { reason, .. }) => {
                        return Err(JobEnd::Failed {
                            reason,
                            notify_device: false,
                        });
                    }
                    Waited::Device(other) => {
                        tracing::debug!(job_id = %self.job_id, msg = ?other, "ignoring stray ota message");
                    }
                    Waited::Cancel(reason) => return Err(JobEnd::Cancelled(reason)),
                    Waited::SessionClosed => {
                        return Err(JobEnd::Failed {
                            reason: "session closed mid-transfer".to_string(),
                            notify_device: false,
                        });
                    }
                    Waited::TimedOut => {
                        tracing::debug!(
                            job_id = %self.job_id,
                            index,
                            attempt,
                            "chunk unacknowledged, retransmitting"
                        );
                        break;
                    }
                }
            }
        }

        let err = Error::OtaIntegrity(format!(
            "chunk {index} unacknowledged after {attempts} attempts"
        ));
        Err(JobEnd::Failed {
            reason: err.to_string(),
            notify_device: true,
        })
    }

    /// Wait for the device to confirm the flashed image, comparing its
    /// reported digest against ours when the firmware sends one
    async fn wait_applied(&mut self) -> std::result::Result<(), JobEnd> {
        loop {
            match self.next(APPLY_TIMEOUT).await {
                Waited::Device(OtaIn::Applied { job_id, sha256 }) if job_id == self.job_id => {
                    if let Some(reported) = sha256
                        && reported != self.image.sha256
                    {
                        let err = Error::OtaIntegrity(format!(
                            "device flashed digest {reported} does not match {}",
                            self.image.sha256
                        ));
                        return Err(JobEnd::Failed {
                            reason: err.to_string(),
                            notify_device: true,
                        });
                    }
                    return Ok(());
                }
                Waited::Device(OtaIn::Failed { reason, .. }) => {
                    return Err(JobEnd::Failed {
                        reason,
                        notify_device: false,
                    });
                }
                Waited::Device(other) => {
                    tracing::debug!(job_id = %self.job_id, msg = ?other, "ignoring stray ota message");
                }
                Waited::Cancel(reason) => return Err(JobEnd::Cancelled(reason)),
                Waited::SessionClosed => {
                    return Err(JobEnd::Failed {
                        reason: "session closed while device was flashing".to_string(),
                        notify_device: false,
                    });
                }
                Waited::TimedOut => {
                    return Err(JobEnd::Failed {
                        reason: "device did not confirm the new image".to_string(),
                        notify_device: true,
                    });
                }
            }
        }
    }

    async fn next(&mut self, limit: Duration) -> Waited {
        tokio::select! {
            msg = self.msg_rx.recv() => msg.map_or(Waited::SessionClosed, Waited::Device),
            sig = self.signal_rx.recv() => match sig {
                Some(JobSignal::Cancel(reason)) => Waited::Cancel(reason),
                Some(JobSignal::SessionClosed) | None => Waited::SessionClosed,
            },
            () = tokio::time::sleep(limit) => Waited::TimedOut,
        }
    }

    async fn send(&self, msg: &OtaOut) -> std::result::Result<(), JobEnd> {
        self.publisher
            .send_ota(&self.device, msg)
            .await
            .map_err(|e: Error| JobEnd::Failed {
                reason: format!("publish failed: {e}"),
                notify_device: false,
            })
    }

    async fn notify_device(&self, reason: &str) {
        let msg = OtaOut::Cancelled {
            job_id: self.job_id.clone(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.publisher.send_ota(&self.device, &msg).await {
            tracing::debug!(job_id = %self.job_id, error = %e, "could not notify device of job end");
        }
    }

    async fn set_state(&mut self, state: OtaState) {
        self.state = state;
        self.checkpoint();
        let _ = self.events.send(OtaEvent::StateChanged(state)).await;
    }

    fn checkpoint(&self) {
        let row = OtaCheckpoint {
            device: self.device.clone(),
            job_id: self.job_id.clone(),
            version: self.image.version.clone(),
            size: self.image.size(),
            sha256: self.image.sha256.clone(),
            bytes_acked: self.bytes_acked,
            state: self.state,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.repo.upsert(&row) {
            tracing::error!(job_id = %self.job_id, error = %e, "failed to write ota checkpoint");
        }
    }
}
