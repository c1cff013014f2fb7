//! Shared fixtures: scripted collaborators, a channel-backed publisher, and
//! audio frame builders.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use ember_gateway::config::{OtaConfig, SegmenterConfig, SessionConfig};
use ember_gateway::ota::checkpoint::{self, CheckpointRepo};
use ember_gateway::pipeline::{
    AudioStream, Collaborators, ContextEntry, ResponseGenerator, SpeechToText, TextToSpeech,
};
use ember_gateway::protocol::{AudioFrame, AudioParams, ControlOut, DeviceId, OtaOut};
use ember_gateway::session::{self, SessionContext, SessionHandle};
use ember_gateway::transport::{FramePublisher, TopicKind};

/// STT that counts invocations and sleeps a scripted delay per call
pub struct ScriptedStt {
    calls: Arc<AtomicUsize>,
    delays_ms: Vec<u64>,
}

impl ScriptedStt {
    pub fn new(delays_ms: Vec<u64>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                delays_ms,
            },
            calls,
        )
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, _wav: &[u8]) -> ember_gateway::Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays_ms.get(call).copied().unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(format!("utterance {call}"))
    }
}

pub struct EchoResponder;

#[async_trait]
impl ResponseGenerator for EchoResponder {
    async fn respond(&self, text: &str, _context: &[ContextEntry]) -> ember_gateway::Result<String> {
        Ok(format!("reply to {text}"))
    }
}

pub struct TwoChunkTts;

#[async_trait]
impl TextToSpeech for TwoChunkTts {
    async fn synthesize(&self, _text: &str) -> ember_gateway::Result<AudioStream> {
        let chunks = vec![Ok(vec![1u8; 32]), Ok(vec![2u8; 32])];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Publisher that forwards every outbound frame to a test channel
pub struct CapturePublisher {
    tx: mpsc::UnboundedSender<(TopicKind, Vec<u8>)>,
}

#[async_trait]
impl FramePublisher for CapturePublisher {
    async fn publish(
        &self,
        _device: &DeviceId,
        kind: TopicKind,
        payload: Vec<u8>,
    ) -> ember_gateway::Result<()> {
        let _ = self.tx.send((kind, payload));
        Ok(())
    }
}

pub type Outbound = mpsc::UnboundedReceiver<(TopicKind, Vec<u8>)>;

/// Segmenter tuning used across tests: no smoothing, short hangover
#[must_use]
pub fn test_segmenter_config() -> SegmenterConfig {
    SegmenterConfig {
        energy_threshold: 700.0,
        window_frames: 1,
        hangover_frames: 10,
        max_utterance_ms: 15_000,
    }
}

/// Spawn a session wired to scripted collaborators and a capture publisher
pub fn spawn_session(
    stt: ScriptedStt,
    segmenter_config: SegmenterConfig,
    ota_config: OtaConfig,
) -> (SessionHandle, Outbound) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = session::spawn(SessionContext {
        device: DeviceId::from("test-device"),
        audio_params: AudioParams::default(),
        session_config: SessionConfig::default(),
        segmenter_config,
        ota_config,
        collaborators: Collaborators {
            stt: Arc::new(stt),
            responder: Arc::new(EchoResponder),
            tts: Arc::new(TwoChunkTts),
        },
        publisher: Arc::new(CapturePublisher { tx }),
        checkpoints: CheckpointRepo::new(checkpoint::init_memory().unwrap()),
    });
    (handle, rx)
}

/// Encoded audio frame with every sample at `amplitude`
#[must_use]
pub fn audio_payload(seq: u32, amplitude: i16) -> Vec<u8> {
    let samples = AudioParams::default().samples_per_frame();
    AudioFrame {
        seq,
        captured_at_ms: u64::from(seq) * 20,
        pcm: vec![amplitude; samples],
    }
    .encode()
}

/// Skip to the next control message on the capture channel
pub async fn next_control(rx: &mut Outbound) -> ControlOut {
    loop {
        let (kind, payload) = rx.recv().await.expect("outbound channel closed");
        if kind == TopicKind::ControlOut {
            return serde_json::from_slice(&payload).expect("invalid control json");
        }
    }
}

/// Skip to the next OTA message on the capture channel
pub async fn next_ota(rx: &mut Outbound) -> OtaOut {
    loop {
        let (kind, payload) = rx.recv().await.expect("outbound channel closed");
        if kind == TopicKind::OtaOut {
            return serde_json::from_slice(&payload).expect("invalid ota json");
        }
    }
}
