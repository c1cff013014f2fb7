//! Voice activity segmentation
//!
//! Turns a device's continuous PCM frame stream into bounded utterances.
//! Classification is RMS energy smoothed over a sliding window of recent
//! frames; an utterance closes after `hangover_frames` consecutive non-speech
//! frames, or when the maximum-duration guard trips. A window longer than one
//! frame extends the effective hangover by `window_frames - 1` frames, since
//! the smoothed energy decays that many frames behind the raw signal.
//!
//! One segmenter per session; no cross-session state.

use std::collections::VecDeque;

use crate::config::SegmenterConfig;
use crate::protocol::{AudioFrame, AudioParams};

/// Why an utterance was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Trailing silence reached the hangover threshold
    Hangover,
    /// The maximum-utterance-duration guard tripped
    MaxDuration,
    /// The device sent `listen stop` or the session is shutting down
    Forced,
}

/// A completed utterance: every frame between speech-start and speech-end
#[derive(Debug, Clone)]
pub struct ClosedUtterance {
    /// Frames in capture order, silence tail included
    pub frames: Vec<AudioFrame>,
    /// Why the boundary fired
    pub reason: CloseReason,
}

impl ClosedUtterance {
    /// Concatenated PCM samples across all frames
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.frames.iter().flat_map(|f| f.pcm.iter().copied()).collect()
    }
}

/// Boundary events emitted by the segmenter
#[derive(Debug)]
pub enum SegmentEvent {
    /// Speech detected; a new utterance is collecting
    Started,
    /// Utterance boundary: the collected frames and the close reason
    Closed(ClosedUtterance),
}

/// Per-session voice activity segmenter
#[derive(Debug)]
pub struct Segmenter {
    energy_threshold: f32,
    window_frames: usize,
    hangover_frames: usize,
    max_utterance_frames: usize,
    /// Recent per-frame RMS values for smoothing
    window: VecDeque<f32>,
    /// Highest sequence number accepted so far
    last_seq: Option<u32>,
    /// Frames of the utterance currently collecting, if any
    open: Option<Vec<AudioFrame>>,
    /// Consecutive non-speech frames since the last speech frame
    silence_run: usize,
}

impl Segmenter {
    /// Create a segmenter for the given tuning and negotiated audio params
    #[must_use]
    pub fn new(config: &SegmenterConfig, params: AudioParams) -> Self {
        let frame_ms = u64::from(params.frame_ms.max(1));
        let max_utterance_frames =
            usize::try_from(config.max_utterance_ms / frame_ms).unwrap_or(usize::MAX).max(1);
        Self {
            energy_threshold: config.energy_threshold,
            window_frames: config.window_frames.max(1),
            hangover_frames: config.hangover_frames.max(1),
            max_utterance_frames,
            window: VecDeque::new(),
            last_seq: None,
            open: None,
            silence_run: 0,
        }
    }

    /// Whether an utterance is currently collecting
    #[must_use]
    pub const fn is_collecting(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one frame; returns a boundary event when one fires
    ///
    /// Frames with non-monotonic sequence numbers (duplicates from the
    /// at-least-once transport, or reordered delivery) are dropped without
    /// touching the open utterance buffer.
    pub fn push(&mut self, frame: AudioFrame) -> Option<SegmentEvent> {
        if let Some(last) = self.last_seq {
            if frame.seq <= last {
                tracing::warn!(
                    seq = frame.seq,
                    last_accepted = last,
                    "dropping duplicate or out-of-order audio frame"
                );
                return None;
            }
        }
        self.last_seq = Some(frame.seq);

        let energy = rms(&frame.pcm);
        self.window.push_back(energy);
        if self.window.len() > self.window_frames {
            self.window.pop_front();
        }
        // Zero-padded at stream start: a short window divides by its full
        // length so a lone blip cannot look like sustained speech.
        #[allow(clippy::cast_precision_loss)]
        let smoothed = self.window.iter().sum::<f32>() / self.window_frames as f32;
        let is_speech = smoothed > self.energy_threshold;

        match (&mut self.open, is_speech) {
            (None, false) => None,
            (None, true) => {
                tracing::debug!(seq = frame.seq, energy, "utterance started");
                self.open = Some(vec![frame]);
                self.silence_run = 0;
                Some(SegmentEvent::Started)
            }
            (Some(buffer), speech) => {
                buffer.push(frame);
                if speech {
                    self.silence_run = 0;
                } else {
                    self.silence_run += 1;
                }

                if self.silence_run >= self.hangover_frames {
                    return Some(self.close(CloseReason::Hangover));
                }
                if self.open.as_ref().is_some_and(|b| b.len() >= self.max_utterance_frames) {
                    tracing::warn!("utterance hit maximum duration, forcing boundary");
                    return Some(self.close(CloseReason::MaxDuration));
                }
                None
            }
        }
    }

    /// Close the open utterance, if any, without waiting for silence
    pub fn force_close(&mut self) -> Option<SegmentEvent> {
        self.open.is_some().then(|| self.close(CloseReason::Forced))
    }

    /// Discard all per-connection state (new transport binding, resume)
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_seq = None;
        self.open = None;
        self.silence_run = 0;
    }

    fn close(&mut self, reason: CloseReason) -> SegmentEvent {
        let frames = self.open.take().unwrap_or_default();
        self.silence_run = 0;
        tracing::debug!(frames = frames.len(), ?reason, "utterance closed");
        SegmentEvent::Closed(ClosedUtterance { frames, reason })
    }
}

/// RMS energy of one PCM frame
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
