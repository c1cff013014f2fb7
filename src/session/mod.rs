//! Per-device session management
//!
//! One tokio task per connected device owns everything session-scoped: the
//! segmenter, the conversation context, in-flight pipeline tasks, and the
//! active OTA job. Nothing else touches that state; the daemon and the OTA
//! task talk to a session only over channels, keyed by device identity.
//!
//! Responses leave in the order their utterances started. Each utterance is
//! assigned a dense ordinal when its segment closes, pipelines run
//! concurrently, and [`sequencer::ResponseSequencer`] holds any stream back
//! until every earlier utterance has finished.

pub mod sequencer;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{OtaConfig, SegmenterConfig, SessionConfig};
use crate::ota::checkpoint::CheckpointRepo;
use crate::ota::{FirmwareImage, OtaEvent, OtaJob};
use crate::pipeline::{
    CancelFlag, Collaborators, ConversationContext, PipelineEvent, run_utterance,
};
use crate::protocol::{
    AudioFrame, AudioParams, ControlIn, ControlOut, DeviceId, ListenState, OtaIn, ResponseFrame,
};
use crate::segmenter::{ClosedUtterance, SegmentEvent, Segmenter};
use crate::transport::FramePublisher;
use sequencer::ResponseSequencer;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake received, authentication pending. Session tasks are never
    /// in this state: the daemon verifies the hello before spawning one, so
    /// the pre-auth phase lives in `Daemon::handle_hello` and sessions start
    /// out `Authenticated`.
    Connecting,
    /// Authenticated, no audio seen yet
    Authenticated,
    /// Connected, no utterance open
    Idle,
    /// An utterance is being captured
    Listening,
    /// Response frames are streaming out
    Responding,
    /// Transport dropped; resumable within the grace period
    Suspended,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Stable string form used in logs and snapshots
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Responding => "responding",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands delivered to a session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Raw payload from `device/{id}/audio/in`
    Audio(Vec<u8>),
    /// Parsed control message (hello is handled by the daemon, not here)
    Control(ControlIn),
    /// Parsed OTA message, forwarded to the active job
    Ota(OtaIn),
    /// Begin delivering a firmware image to this device
    StartOta(Arc<FirmwareImage>),
    /// Device reconnected with the same identity; merge the new binding
    Rebind {
        /// Audio parameters requested in the new hello
        audio_params: Option<AudioParams>,
    },
    /// Broker connectivity lost; hold state for the grace period
    Suspend,
    /// Broker connectivity restored
    Resume,
    /// Operator cancelled the active OTA job
    CancelOta {
        /// Reason recorded in the checkpoint and sent to the device
        reason: String,
    },
    /// Close the session (daemon shutdown)
    Shutdown,
}

/// Everything a session task needs at spawn
pub struct SessionContext {
    /// Device this session belongs to
    pub device: DeviceId,
    /// Negotiated audio parameters
    pub audio_params: AudioParams,
    /// Session tuning
    pub session_config: SessionConfig,
    /// Segmenter tuning
    pub segmenter_config: SegmenterConfig,
    /// OTA tuning (used when a job is started for this device)
    pub ota_config: OtaConfig,
    /// STT / response / TTS collaborators
    pub collaborators: Collaborators,
    /// Outbound publishing seam
    pub publisher: Arc<dyn FramePublisher>,
    /// OTA checkpoint store
    pub checkpoints: CheckpointRepo,
}

/// Cloneable handle to a running session, stored in the registry
#[derive(Debug, Clone)]
pub struct SessionHandle {
    device: DeviceId,
    session_id: Uuid,
    connected_at: DateTime<Utc>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// The device this session belongs to
    #[must_use]
    pub const fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The server-assigned session id
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// When the session was created
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The session's current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Whether the session has reached its terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Deliver a command; dropped silently if the session already closed
    pub async fn send(&self, cmd: SessionCommand) {
        if self.cmd_tx.send(cmd).await.is_err() {
            tracing::debug!(device = %self.device, "command for closed session dropped");
        }
    }

    /// Wait until the session reaches [`SessionState::Closed`]
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        while *rx.borrow() != SessionState::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawn a session task and return its handle
///
/// The task immediately acknowledges the handshake with a `hello_ack`
/// carrying the negotiated audio parameters.
#[must_use]
pub fn spawn(ctx: SessionContext) -> SessionHandle {
    let session_id = Uuid::new_v4();
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(SessionState::Authenticated);
    let (pipeline_tx, pipeline_rx) = mpsc::channel(64);
    let (ota_tx, ota_rx) = mpsc::channel(16);
    let context = ConversationContext::new(ctx.session_config.context_window);

    let session = Session {
        device: ctx.device.clone(),
        session_id,
        config: ctx.session_config,
        ota_config: ctx.ota_config,
        audio_params: ctx.audio_params,
        segmenter: Segmenter::new(&ctx.segmenter_config, ctx.audio_params),
        segmenter_config: ctx.segmenter_config,
        collaborators: ctx.collaborators,
        publisher: ctx.publisher,
        checkpoints: ctx.checkpoints,
        state: SessionState::Authenticated,
        resume_state: SessionState::Idle,
        state_tx,
        sequencer: ResponseSequencer::new(),
        context,
        next_ordinal: 0,
        inflight: HashMap::new(),
        pipeline_tx,
        ota_tx,
        ota_job: None,
        ota_hold: false,
        hold_queue: VecDeque::new(),
        busy_sent: false,
        iot_descriptors: None,
        iot_states: None,
        violations: 0,
        last_activity: Instant::now(),
        suspended_at: None,
    };
    tokio::spawn(session.run(cmd_rx, pipeline_rx, ota_rx));

    SessionHandle {
        device: ctx.device,
        session_id,
        connected_at: Utc::now(),
        cmd_tx,
        state_rx,
    }
}

struct Session {
    device: DeviceId,
    session_id: Uuid,
    config: SessionConfig,
    ota_config: OtaConfig,
    audio_params: AudioParams,
    segmenter: Segmenter,
    segmenter_config: SegmenterConfig,
    collaborators: Collaborators,
    publisher: Arc<dyn FramePublisher>,
    checkpoints: CheckpointRepo,
    state: SessionState,
    /// State to restore when a suspend lifts
    resume_state: SessionState,
    state_tx: watch::Sender<SessionState>,
    sequencer: ResponseSequencer,
    context: ConversationContext,
    next_ordinal: u64,
    /// Cancellation flags for pipelines that have not finished yet
    inflight: HashMap<u64, CancelFlag>,
    pipeline_tx: mpsc::Sender<PipelineEvent>,
    ota_tx: mpsc::Sender<OtaEvent>,
    ota_job: Option<OtaJob>,
    /// True while the OTA job is transferring or verifying
    ota_hold: bool,
    /// Audio queued during an OTA hold, replayed on release
    hold_queue: VecDeque<AudioFrame>,
    /// Whether the busy notice for the current hold burst went out
    busy_sent: bool,
    /// Peripheral schema the device reported, kept for the session's lifetime
    iot_descriptors: Option<serde_json::Value>,
    /// Latest peripheral states the device reported
    iot_states: Option<serde_json::Value>,
    violations: u32,
    last_activity: Instant,
    suspended_at: Option<Instant>,
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut pipeline_rx: mpsc::Receiver<PipelineEvent>,
        mut ota_rx: mpsc::Receiver<OtaEvent>,
    ) {
        tracing::info!(device = %self.device, session = %self.session_id, "session started");
        self.send_control(ControlOut::HelloAck {
            session_id: self.session_id.to_string(),
            audio_params: self.audio_params,
        })
        .await;

        loop {
            let deadline = self.deadline();
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.close("command channel closed", false).await,
                },
                Some(event) = pipeline_rx.recv() => self.handle_pipeline(event).await,
                Some(event) = ota_rx.recv() => self.handle_ota(event),
                () = tokio::time::sleep_until(deadline) => self.handle_deadline().await,
            }
            if self.state == SessionState::Closed {
                break;
            }
        }
        tracing::info!(device = %self.device, session = %self.session_id, "session ended");
    }

    /// Grace expiry while suspended, idle timeout otherwise
    fn deadline(&self) -> Instant {
        self.suspended_at.map_or_else(
            || self.last_activity + Duration::from_secs(self.config.idle_timeout_secs),
            |at| at + Duration::from_secs(self.config.grace_period_secs),
        )
    }

    async fn handle_deadline(&mut self) {
        if self.state == SessionState::Suspended {
            self.close("grace period expired", false).await;
        } else {
            self.close("idle timeout", true).await;
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Audio(payload) => {
                self.last_activity = Instant::now();
                self.handle_audio(payload).await;
            }
            SessionCommand::Control(msg) => {
                self.last_activity = Instant::now();
                self.handle_control(msg).await;
            }
            SessionCommand::Ota(msg) => {
                self.last_activity = Instant::now();
                if let Some(job) = &self.ota_job {
                    job.deliver(msg).await;
                } else {
                    tracing::debug!(device = %self.device, "ota message with no active job");
                }
            }
            SessionCommand::StartOta(image) => self.start_ota(image),
            SessionCommand::Rebind { audio_params } => self.rebind(audio_params).await,
            SessionCommand::Suspend => self.suspend(),
            SessionCommand::Resume => self.resume(),
            SessionCommand::CancelOta { reason } => {
                if let Some(job) = &self.ota_job {
                    job.cancel(reason).await;
                } else {
                    tracing::debug!(device = %self.device, "cancel for device with no active job");
                }
            }
            SessionCommand::Shutdown => self.close("server shutting down", true).await,
        }
    }

    async fn handle_audio(&mut self, payload: Vec<u8>) {
        if self.state == SessionState::Suspended {
            // QoS 1 can redeliver frames queued before the transport dropped
            tracing::debug!(device = %self.device, "audio while suspended dropped");
            return;
        }
        let frame = match AudioFrame::decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.violation(&format!("malformed audio frame: {e}")).await;
                return;
            }
        };
        if self.ota_hold {
            self.queue_held(frame).await;
            return;
        }
        self.ingest(frame);
    }

    /// Feed one frame to the segmenter and react to boundary events
    fn ingest(&mut self, frame: AudioFrame) {
        match self.segmenter.push(frame) {
            Some(SegmentEvent::Started) => self.set_state(SessionState::Listening),
            Some(SegmentEvent::Closed(utterance)) => {
                self.spawn_pipeline(utterance);
                // capture is pipelined: new audio reopens Listening at once
                if self.state == SessionState::Listening {
                    self.set_state(SessionState::Idle);
                }
            }
            None => {}
        }
    }

    /// Queue audio that arrived during an OTA hold, telling the device once
    async fn queue_held(&mut self, frame: AudioFrame) {
        if self.hold_queue.len() >= self.config.hold_queue_frames {
            self.hold_queue.pop_front();
        }
        self.hold_queue.push_back(frame);
        if !self.busy_sent {
            self.busy_sent = true;
            self.send_control(ControlOut::Busy {
                retry_after_ms: self.config.busy_retry_ms,
            })
            .await;
        }
    }

    async fn handle_control(&mut self, msg: ControlIn) {
        match msg {
            ControlIn::Hello { .. } => {
                // The daemon owns the handshake; one reaching us is a bug in
                // the device's state machine.
                self.violation("hello on an established session").await;
            }
            ControlIn::Goodbye => {
                self.send_control(ControlOut::Goodbye).await;
                self.close("device said goodbye", false).await;
            }
            ControlIn::Listen { state, text } => self.handle_listen(state, text).await,
            ControlIn::Iot {
                descriptors,
                states,
            } => {
                if let Some(descriptors) = descriptors {
                    tracing::info!(
                        device = %self.device,
                        replacing = self.iot_descriptors.is_some(),
                        "peripheral descriptors reported"
                    );
                    self.iot_descriptors = Some(descriptors);
                }
                if let Some(states) = states {
                    tracing::debug!(
                        device = %self.device,
                        first_report = self.iot_states.is_none(),
                        "peripheral states updated"
                    );
                    self.iot_states = Some(states);
                }
            }
            ControlIn::Abort { reason } => {
                tracing::debug!(
                    device = %self.device,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "device aborted response"
                );
                self.cancel_inflight();
                self.sequencer.clear_buffered();
                if self.state == SessionState::Responding {
                    self.set_state(SessionState::Idle);
                }
            }
        }
    }

    async fn handle_listen(&mut self, state: ListenState, text: Option<String>) {
        match state {
            ListenState::Start => {
                if self.ota_hold {
                    if !self.busy_sent {
                        self.busy_sent = true;
                        self.send_control(ControlOut::Busy {
                            retry_after_ms: self.config.busy_retry_ms,
                        })
                        .await;
                    }
                    return;
                }
                self.set_state(SessionState::Listening);
            }
            ListenState::Stop => {
                if let Some(SegmentEvent::Closed(utterance)) = self.segmenter.force_close() {
                    self.spawn_pipeline(utterance);
                }
                if self.state == SessionState::Listening {
                    self.set_state(SessionState::Idle);
                }
            }
            ListenState::Detect => {
                tracing::debug!(
                    device = %self.device,
                    wake_word = text.as_deref().unwrap_or(""),
                    "wake word detected"
                );
            }
        }
    }

    /// Assign the next ordinal and run the utterance's pipeline in its own task
    fn spawn_pipeline(&mut self, utterance: ClosedUtterance) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let cancel = CancelFlag::new();
        self.inflight.insert(ordinal, cancel.clone());

        let utterance_id = Uuid::new_v4();
        tracing::debug!(
            device = %self.device,
            utterance = %utterance_id,
            ordinal,
            frames = utterance.frames.len(),
            "utterance closed"
        );
        tokio::spawn(run_utterance(
            self.collaborators.clone(),
            utterance_id,
            ordinal,
            utterance,
            self.audio_params.sample_rate,
            self.context.snapshot(),
            cancel,
            self.pipeline_tx.clone(),
        ));
    }

    async fn handle_pipeline(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Frame(frame) => {
                let released = self.sequencer.push_frame(frame.ordinal, frame);
                self.publish_frames(released).await;
            }
            PipelineEvent::Completed {
                ordinal,
                transcript,
                reply,
            } => {
                if !transcript.is_empty() {
                    self.context.push(transcript, reply);
                }
                self.finish_utterance(ordinal).await;
            }
            PipelineEvent::Aborted {
                ordinal,
                stage,
                message,
            } => {
                tracing::warn!(
                    device = %self.device,
                    ordinal,
                    stage = %stage,
                    %message,
                    "utterance aborted"
                );
                self.send_control(ControlOut::StageError {
                    ordinal,
                    stage,
                    message,
                })
                .await;
                self.finish_utterance(ordinal).await;
            }
            PipelineEvent::Cancelled { ordinal } => {
                self.finish_utterance(ordinal).await;
            }
        }
    }

    /// Mark an utterance finished in the sequencer and flush what it unblocks
    async fn finish_utterance(&mut self, ordinal: u64) {
        self.inflight.remove(&ordinal);
        let released = self.sequencer.finish(ordinal);
        self.publish_frames(released).await;
        if self.state == SessionState::Responding
            && self.inflight.is_empty()
            && !self.sequencer.has_buffered()
        {
            if self.segmenter.is_collecting() {
                self.set_state(SessionState::Listening);
            } else {
                self.set_state(SessionState::Idle);
            }
        }
    }

    async fn publish_frames(&mut self, frames: Vec<ResponseFrame>) {
        if frames.is_empty() {
            return;
        }
        if matches!(
            self.state,
            SessionState::Idle | SessionState::Listening | SessionState::Authenticated
        ) {
            self.set_state(SessionState::Responding);
        }
        for frame in frames {
            if let Err(e) = self.publisher.send_response(&self.device, &frame).await {
                tracing::warn!(device = %self.device, error = %e, "response frame publish failed");
            }
        }
    }

    fn start_ota(&mut self, image: Arc<FirmwareImage>) {
        if self.ota_job.is_some() {
            tracing::warn!(device = %self.device, "ota job already active, ignoring start");
            return;
        }
        let job = OtaJob::spawn(
            self.device.clone(),
            image,
            self.ota_config.clone(),
            Arc::clone(&self.publisher),
            self.checkpoints.clone(),
            self.ota_tx.clone(),
        );
        tracing::info!(
            device = %self.device,
            job_id = %job.job_id(),
            version = %job.version(),
            "ota job started"
        );
        self.ota_job = Some(job);
    }

    fn handle_ota(&mut self, event: OtaEvent) {
        let OtaEvent::StateChanged(state) = event;
        if state.holds_session() {
            self.ota_hold = true;
            return;
        }
        if state.is_terminal() {
            self.ota_job = None;
            if self.ota_hold {
                self.release_hold();
            }
        }
    }

    /// Lift the OTA hold and replay queued capture through the segmenter
    fn release_hold(&mut self) {
        self.ota_hold = false;
        self.busy_sent = false;
        let queued: Vec<AudioFrame> = self.hold_queue.drain(..).collect();
        tracing::debug!(device = %self.device, frames = queued.len(), "replaying held audio");
        for frame in queued {
            self.ingest(frame);
        }
    }

    async fn rebind(&mut self, audio_params: Option<AudioParams>) {
        // A fresh binding restarts frame sequencing at zero. Flush whatever
        // the old binding left open, then clear the sequence watermark and
        // smoothing window so the first frames are not dropped as stale.
        if let Some(SegmentEvent::Closed(utterance)) = self.segmenter.force_close() {
            self.spawn_pipeline(utterance);
        }
        if let Some(params) = audio_params
            && params != self.audio_params
        {
            self.audio_params = params;
            self.segmenter = Segmenter::new(&self.segmenter_config, params);
        } else {
            self.segmenter.reset();
        }
        if self.state == SessionState::Suspended {
            self.suspended_at = None;
            let restored = self.resume_state;
            self.set_state(restored);
            tracing::info!(device = %self.device, session = %self.session_id, "session resumed");
        }
        self.last_activity = Instant::now();
        self.send_control(ControlOut::HelloAck {
            session_id: self.session_id.to_string(),
            audio_params: self.audio_params,
        })
        .await;
    }

    fn suspend(&mut self) {
        if matches!(self.state, SessionState::Suspended | SessionState::Closed) {
            return;
        }
        self.resume_state = self.state;
        self.suspended_at = Some(Instant::now());
        self.set_state(SessionState::Suspended);
    }

    fn resume(&mut self) {
        if self.state == SessionState::Suspended {
            self.suspended_at = None;
            let restored = self.resume_state;
            self.set_state(restored);
        }
    }

    async fn violation(&mut self, what: &str) {
        self.violations += 1;
        tracing::warn!(
            device = %self.device,
            count = self.violations,
            limit = self.config.violation_limit,
            "protocol violation: {what}"
        );
        if self.violations >= self.config.violation_limit {
            self.send_control(ControlOut::Error {
                message: "too many protocol violations".to_string(),
            })
            .await;
            self.close("protocol violation limit reached", true).await;
        }
    }

    fn cancel_inflight(&mut self) {
        for flag in self.inflight.values() {
            flag.cancel();
        }
    }

    async fn close(&mut self, reason: &str, notify: bool) {
        if self.state == SessionState::Closed {
            return;
        }
        tracing::info!(device = %self.device, session = %self.session_id, reason, "closing session");
        self.cancel_inflight();
        self.sequencer.clear_buffered();
        if let Some(job) = &self.ota_job {
            job.session_closed();
        }
        if notify {
            self.send_control(ControlOut::Goodbye).await;
        }
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(device = %self.device, from = %self.state, to = %state, "state");
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    async fn send_control(&self, msg: ControlOut) {
        if let Err(e) = self.publisher.send_control(&self.device, &msg).await {
            tracing::warn!(device = %self.device, error = %e, "control publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AudioStream, ResponseGenerator, SpeechToText, TextToSpeech};
    use crate::transport::TopicKind;
    use async_trait::async_trait;
    use futures::StreamExt;

    struct FixedStt;

    #[async_trait]
    impl SpeechToText for FixedStt {
        async fn transcribe(&self, _wav: &[u8]) -> crate::Result<String> {
            Ok("turn on the lights".to_string())
        }
    }

    struct EchoResponder;

    #[async_trait]
    impl ResponseGenerator for EchoResponder {
        async fn respond(
            &self,
            text: &str,
            _context: &[crate::pipeline::ContextEntry],
        ) -> crate::Result<String> {
            Ok(format!("ok: {text}"))
        }
    }

    struct ChunkTts;

    #[async_trait]
    impl TextToSpeech for ChunkTts {
        async fn synthesize(&self, _text: &str) -> crate::Result<AudioStream> {
            let chunks = vec![Ok(vec![1u8; 32]), Ok(vec![2u8; 32])];
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            stt: Arc::new(FixedStt),
            responder: Arc::new(EchoResponder),
            tts: Arc::new(ChunkTts),
        }
    }

    struct CapturePublisher {
        tx: mpsc::UnboundedSender<(TopicKind, Vec<u8>)>,
    }

    #[async_trait]
    impl FramePublisher for CapturePublisher {
        async fn publish(
            &self,
            _device: &DeviceId,
            kind: TopicKind,
            payload: Vec<u8>,
        ) -> crate::Result<()> {
            let _ = self.tx.send((kind, payload));
            Ok(())
        }
    }

    fn test_session() -> (SessionHandle, mpsc::UnboundedReceiver<(TopicKind, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let params = AudioParams::default();
        let handle = spawn(SessionContext {
            device: DeviceId::from("d1"),
            audio_params: params,
            session_config: SessionConfig {
                violation_limit: 2,
                ..SessionConfig::default()
            },
            segmenter_config: SegmenterConfig {
                energy_threshold: 700.0,
                window_frames: 1,
                hangover_frames: 2,
                max_utterance_ms: 15_000,
            },
            ota_config: OtaConfig::default(),
            collaborators: collaborators(),
            publisher: Arc::new(CapturePublisher { tx }),
            checkpoints: CheckpointRepo::new(crate::ota::checkpoint::init_memory().unwrap()),
        });
        (handle, rx)
    }

    fn frame(seq: u32, amplitude: i16) -> Vec<u8> {
        let samples = AudioParams::default().samples_per_frame();
        AudioFrame {
            seq,
            captured_at_ms: u64::from(seq) * 20,
            pcm: vec![amplitude; samples],
        }
        .encode()
    }

    async fn next_control(
        rx: &mut mpsc::UnboundedReceiver<(TopicKind, Vec<u8>)>,
    ) -> ControlOut {
        loop {
            let (kind, payload) = rx.recv().await.unwrap();
            if kind == TopicKind::ControlOut {
                return serde_json::from_slice(&payload).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn handshake_is_acknowledged() {
        let (handle, mut rx) = test_session();
        let ControlOut::HelloAck {
            session_id,
            audio_params,
        } = next_control(&mut rx).await
        else {
            panic!("expected hello_ack first");
        };
        assert_eq!(session_id, handle.session_id().to_string());
        assert_eq!(audio_params, AudioParams::default());
    }

    #[tokio::test]
    async fn utterance_produces_ordered_response_stream() {
        let (handle, mut rx) = test_session();
        let _ = next_control(&mut rx).await; // hello_ack

        for seq in 0..5 {
            handle.send(SessionCommand::Audio(frame(seq, 3_000))).await;
        }
        for seq in 5..8 {
            handle.send(SessionCommand::Audio(frame(seq, 0))).await;
        }

        let mut chunks = Vec::new();
        loop {
            let (kind, payload) = rx.recv().await.unwrap();
            if kind != TopicKind::AudioOut {
                continue;
            }
            let frame = ResponseFrame::decode(&payload).unwrap();
            assert_eq!(frame.ordinal, 0);
            let done = frame.is_end();
            chunks.push(frame);
            if done {
                break;
            }
        }
        // two audio chunks then the end marker, chunk_seq strictly increasing
        assert_eq!(chunks.len(), 3);
        for (i, frame) in chunks.iter().enumerate() {
            assert_eq!(frame.chunk_seq, u32::try_from(i).unwrap());
        }
    }

    #[tokio::test]
    async fn goodbye_is_echoed_and_closes() {
        let (handle, mut rx) = test_session();
        let _ = next_control(&mut rx).await;

        handle.send(SessionCommand::Control(ControlIn::Goodbye)).await;
        assert!(matches!(next_control(&mut rx).await, ControlOut::Goodbye));

        handle.closed().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn iot_reports_are_stored_without_protest() {
        let (handle, mut rx) = test_session();
        let _ = next_control(&mut rx).await;

        // violation_limit is 2; two reports must not trip it
        handle
            .send(SessionCommand::Control(ControlIn::Iot {
                descriptors: Some(serde_json::json!([{"name": "lamp"}])),
                states: None,
            }))
            .await;
        handle
            .send(SessionCommand::Control(ControlIn::Iot {
                descriptors: None,
                states: Some(serde_json::json!({"lamp": "on"})),
            }))
            .await;

        handle.send(SessionCommand::Control(ControlIn::Goodbye)).await;
        assert!(matches!(next_control(&mut rx).await, ControlOut::Goodbye));
    }

    #[tokio::test]
    async fn repeated_violations_close_the_session() {
        let (handle, mut rx) = test_session();
        let _ = next_control(&mut rx).await;

        // violation_limit is 2 in the test config
        handle.send(SessionCommand::Audio(vec![0xFF; 3])).await;
        handle.send(SessionCommand::Audio(vec![0xFF; 3])).await;

        assert!(matches!(
            next_control(&mut rx).await,
            ControlOut::Error { .. }
        ));
        assert!(matches!(next_control(&mut rx).await, ControlOut::Goodbye));
        handle.closed().await;
    }

    #[tokio::test]
    async fn suspend_then_rebind_restores_state_and_reacks() {
        let (handle, mut rx) = test_session();
        let _ = next_control(&mut rx).await;

        handle.send(SessionCommand::Suspend).await;
        handle
            .send(SessionCommand::Rebind { audio_params: None })
            .await;

        let ControlOut::HelloAck { session_id, .. } = next_control(&mut rx).await else {
            panic!("expected hello_ack on rebind");
        };
        assert_eq!(session_id, handle.session_id().to_string());
        assert_ne!(handle.state(), SessionState::Suspended);
        assert_ne!(handle.state(), SessionState::Closed);
    }
}
