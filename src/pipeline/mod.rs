//! Dialogue pipeline: STT → response generation → TTS
//!
//! Each closed utterance runs through [`run_utterance`] in its own task.
//! Stage failures abort the one utterance and are reported back to the
//! session; the session itself stays alive. A cancellation flag is checked at
//! every suspension point, and cancellation abandons collaborator results
//! rather than waiting for them.

mod context;
pub mod providers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use context::{ContextEntry, ConversationContext};

use crate::audio::pcm_to_wav;
use crate::error::PipelineStage;
use crate::protocol::ResponseFrame;
use crate::segmenter::ClosedUtterance;
use crate::{Error, Result};

/// Lazy sequence of synthesized audio chunks
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Speech-to-text collaborator
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe WAV audio to text
    ///
    /// # Errors
    ///
    /// Returns a transcription-stage error on failure
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Response-generation collaborator
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce a reply to `text` given the rolling conversation context
    ///
    /// # Errors
    ///
    /// Returns a generation-stage error on failure
    async fn respond(&self, text: &str, context: &[ContextEntry]) -> Result<String>;
}

/// Text-to-speech collaborator
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize a reply as a lazy stream of audio chunks
    ///
    /// # Errors
    ///
    /// Returns a synthesis-stage error on failure
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// The collaborator set shared by every session
#[derive(Clone)]
pub struct Collaborators {
    /// Speech-to-text backend
    pub stt: Arc<dyn SpeechToText>,
    /// Response generation backend
    pub responder: Arc<dyn ResponseGenerator>,
    /// Text-to-speech backend
    pub tts: Arc<dyn TextToSpeech>,
}

/// Cooperative cancellation flag checked at pipeline suspension points
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Events a pipeline task reports back to its session
#[derive(Debug)]
pub enum PipelineEvent {
    /// One outbound response frame (audio chunk or end marker)
    Frame(ResponseFrame),
    /// The utterance finished; transcript and reply feed the context window
    Completed {
        /// Utterance ordinal
        ordinal: u64,
        /// What the user said
        transcript: String,
        /// What the assistant replied
        reply: String,
    },
    /// A stage failed; the utterance is aborted, the session survives
    Aborted {
        /// Utterance ordinal
        ordinal: u64,
        /// Stage that failed
        stage: PipelineStage,
        /// Collaborator-reported detail
        message: String,
    },
    /// The utterance was cancelled; nothing is reported to the device
    Cancelled {
        /// Utterance ordinal
        ordinal: u64,
    },
}

/// Run one closed utterance through STT → respond → TTS
///
/// All outcomes are delivered as [`PipelineEvent`]s on `events`; this
/// function never returns an error. Frames are tagged with the utterance
/// ordinal and terminated by an end-of-response marker.
#[allow(clippy::too_many_lines)]
pub async fn run_utterance(
    collab: Collaborators,
    utterance_id: Uuid,
    ordinal: u64,
    utterance: ClosedUtterance,
    sample_rate: u32,
    context: Vec<ContextEntry>,
    cancel: CancelFlag,
    events: mpsc::Sender<PipelineEvent>,
) {
    let send = |event: PipelineEvent| {
        let events = events.clone();
        async move {
            // The session may already be gone; nothing to do then
            let _ = events.send(event).await;
        }
    };

    if cancel.is_cancelled() {
        send(PipelineEvent::Cancelled { ordinal }).await;
        return;
    }

    let samples = utterance.samples();
    tracing::debug!(
        utterance = %utterance_id,
        ordinal,
        samples = samples.len(),
        "pipeline started"
    );

    let wav = match pcm_to_wav(&samples, sample_rate) {
        Ok(wav) => wav,
        Err(e) => {
            send(PipelineEvent::Aborted {
                ordinal,
                stage: PipelineStage::Transcription,
                message: e.to_string(),
            })
            .await;
            return;
        }
    };

    // Stage 1: transcription
    let transcript = match collab.stt.transcribe(&wav).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(utterance = %utterance_id, error = %e, "transcription failed");
            send(PipelineEvent::Aborted {
                ordinal,
                stage: PipelineStage::Transcription,
                message: stage_message(&e),
            })
            .await;
            return;
        }
    };
    if cancel.is_cancelled() {
        send(PipelineEvent::Cancelled { ordinal }).await;
        return;
    }
    if transcript.trim().is_empty() {
        // Nothing intelligible; complete silently so later utterances flush
        tracing::debug!(utterance = %utterance_id, "empty transcript, skipping response");
        send(PipelineEvent::Completed {
            ordinal,
            transcript: String::new(),
            reply: String::new(),
        })
        .await;
        return;
    }

    // Stage 2: response generation
    let reply = match collab.responder.respond(&transcript, &context).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(utterance = %utterance_id, error = %e, "generation failed");
            send(PipelineEvent::Aborted {
                ordinal,
                stage: PipelineStage::Generation,
                message: stage_message(&e),
            })
            .await;
            return;
        }
    };
    if cancel.is_cancelled() {
        send(PipelineEvent::Cancelled { ordinal }).await;
        return;
    }

    // Stage 3: synthesis, streamed
    let mut stream = match collab.tts.synthesize(&reply).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(utterance = %utterance_id, error = %e, "synthesis failed");
            send(PipelineEvent::Aborted {
                ordinal,
                stage: PipelineStage::Synthesis,
                message: stage_message(&e),
            })
            .await;
            return;
        }
    };

    let mut chunk_seq: u32 = 0;
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            send(PipelineEvent::Cancelled { ordinal }).await;
            return;
        }
        match chunk {
            Ok(audio) => {
                send(PipelineEvent::Frame(ResponseFrame::audio(
                    ordinal, chunk_seq, audio,
                )))
                .await;
                chunk_seq += 1;
            }
            Err(e) => {
                tracing::warn!(utterance = %utterance_id, error = %e, "synthesis stream failed");
                send(PipelineEvent::Aborted {
                    ordinal,
                    stage: PipelineStage::Synthesis,
                    message: stage_message(&e),
                })
                .await;
                return;
            }
        }
    }

    send(PipelineEvent::Frame(ResponseFrame::end_marker(
        ordinal, chunk_seq,
    )))
    .await;
    send(PipelineEvent::Completed {
        ordinal,
        transcript,
        reply,
    })
    .await;
    tracing::debug!(utterance = %utterance_id, ordinal, chunks = chunk_seq, "pipeline finished");
}

/// Strip the stage prefix when the collaborator already returned a stage error
fn stage_message(e: &Error) -> String {
    match e {
        Error::PipelineStage { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AudioFrame;
    use crate::segmenter::CloseReason;

    struct FixedStt(&'static str);

    #[async_trait]
    impl SpeechToText for FixedStt {
        async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct EchoResponder;

    #[async_trait]
    impl ResponseGenerator for EchoResponder {
        async fn respond(&self, text: &str, _context: &[ContextEntry]) -> Result<String> {
            Ok(format!("you said: {text}"))
        }
    }

    struct ChunkedTts(usize);

    #[async_trait]
    impl TextToSpeech for ChunkedTts {
        async fn synthesize(&self, _text: &str) -> Result<AudioStream> {
            let chunks: Vec<Result<Vec<u8>>> =
                (0..self.0).map(|i| Ok(vec![u8::try_from(i).unwrap_or(0); 8])).collect();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    struct FailingTts;

    #[async_trait]
    impl TextToSpeech for FailingTts {
        async fn synthesize(&self, _text: &str) -> Result<AudioStream> {
            Err(Error::stage(PipelineStage::Synthesis, "voice offline"))
        }
    }

    fn collaborators(tts: Arc<dyn TextToSpeech>) -> Collaborators {
        Collaborators {
            stt: Arc::new(FixedStt("turn on the lights")),
            responder: Arc::new(EchoResponder),
            tts,
        }
    }

    fn utterance() -> ClosedUtterance {
        ClosedUtterance {
            frames: vec![AudioFrame {
                seq: 1,
                captured_at_ms: 0,
                pcm: vec![1_000; 320],
            }],
            reason: CloseReason::Hangover,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn happy_path_emits_frames_marker_and_completion() {
        let (tx, rx) = mpsc::channel(32);
        run_utterance(
            collaborators(Arc::new(ChunkedTts(3))),
            Uuid::new_v4(),
            0,
            utterance(),
            16_000,
            Vec::new(),
            CancelFlag::new(),
            tx,
        )
        .await;

        let events = drain(rx).await;
        let frames: Vec<&ResponseFrame> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 4); // 3 audio chunks + end marker
        assert!(frames[3].is_end());
        assert!(frames[..3].iter().all(|f| !f.is_end()));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::Completed { transcript, reply, .. })
                if transcript == "turn on the lights" && reply == "you said: turn on the lights"
        ));
    }

    #[tokio::test]
    async fn synthesis_failure_aborts_with_stage() {
        let (tx, rx) = mpsc::channel(32);
        run_utterance(
            collaborators(Arc::new(FailingTts)),
            Uuid::new_v4(),
            3,
            utterance(),
            16_000,
            Vec::new(),
            CancelFlag::new(),
            tx,
        )
        .await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            PipelineEvent::Aborted { ordinal: 3, stage: PipelineStage::Synthesis, message }
                if message == "voice offline"
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_pipeline_reports_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();

        let (tx, rx) = mpsc::channel(32);
        run_utterance(
            collaborators(Arc::new(ChunkedTts(3))),
            Uuid::new_v4(),
            5,
            utterance(),
            16_000,
            Vec::new(),
            cancel,
            tx,
        )
        .await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PipelineEvent::Cancelled { ordinal: 5 }));
    }
}
