//! Wire formats shared with device firmware
//!
//! Audio travels as framed binary payloads; everything else (control and OTA
//! traffic) is tagged JSON. Binary layouts are fixed and versioned so old
//! firmware can be rejected instead of misparsed.

use serde::{Deserialize, Serialize};

use crate::error::PipelineStage;
use crate::{Error, Result};

/// Binary frame layout version understood by this server
pub const WIRE_VERSION: u8 = 1;

/// Control protocol version devices must announce in `hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Inbound audio frame header length: version + seq + capture timestamp
const AUDIO_IN_HEADER: usize = 1 + 4 + 8;

/// Outbound audio frame header length: version + ordinal + chunk seq + flags
const AUDIO_OUT_HEADER: usize = 1 + 8 + 4 + 1;

/// Outbound frame flag: final frame of a response stream (empty payload)
pub const FLAG_END_OF_RESPONSE: u8 = 0b0000_0001;

/// Opaque, stable device identity (MAC-derived or provisioned)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a raw identity string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identity string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Audio parameters negotiated during the hello handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 20,
        }
    }
}

impl AudioParams {
    /// Samples per frame at the negotiated rate and duration
    #[must_use]
    pub const fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize / 1000) * self.frame_ms as usize
    }
}

/// One raw PCM chunk captured by a device microphone
///
/// Sequence numbers increase monotonically per device connection; the
/// segmenter drops anything that does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonic per-connection sequence number
    pub seq: u32,
    /// Device capture timestamp, milliseconds since the epoch
    pub captured_at_ms: u64,
    /// Signed 16-bit mono PCM samples
    pub pcm: Vec<i16>,
}

impl AudioFrame {
    /// Encode to the binary wire layout
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUDIO_IN_HEADER + self.pcm.len() * 2);
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.captured_at_ms.to_be_bytes());
        for sample in &self.pcm {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
        buf
    }

    /// Decode from the binary wire layout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Segmentation`] if the payload is truncated, carries an
    /// unknown version byte, or has an odd PCM byte count.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < AUDIO_IN_HEADER {
            return Err(Error::Segmentation(format!(
                "audio frame too short: {} bytes",
                payload.len()
            )));
        }
        if payload[0] != WIRE_VERSION {
            return Err(Error::Segmentation(format!(
                "unknown audio frame version {}",
                payload[0]
            )));
        }
        let seq = u32::from_be_bytes(payload[1..5].try_into().map_err(|_| {
            Error::Segmentation("audio frame header truncated".to_string())
        })?);
        let captured_at_ms = u64::from_be_bytes(payload[5..13].try_into().map_err(|_| {
            Error::Segmentation("audio frame header truncated".to_string())
        })?);
        let body = &payload[AUDIO_IN_HEADER..];
        if body.len() % 2 != 0 {
            return Err(Error::Segmentation(format!(
                "odd PCM byte count: {}",
                body.len()
            )));
        }
        let pcm = body
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Self {
            seq,
            captured_at_ms,
            pcm,
        })
    }
}

/// One chunk of a synthesized response stream, tagged with the utterance it
/// answers so firmware can match replies to questions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Ordinal of the utterance this frame answers (session-scoped)
    pub ordinal: u64,
    /// Position within the response stream
    pub chunk_seq: u32,
    /// Frame flags; see [`FLAG_END_OF_RESPONSE`]
    pub flags: u8,
    /// Synthesized audio bytes (empty on the end marker)
    pub audio: Vec<u8>,
}

impl ResponseFrame {
    /// Build an audio chunk frame
    #[must_use]
    pub const fn audio(ordinal: u64, chunk_seq: u32, audio: Vec<u8>) -> Self {
        Self {
            ordinal,
            chunk_seq,
            flags: 0,
            audio,
        }
    }

    /// Build the end-of-response marker for an utterance
    #[must_use]
    pub const fn end_marker(ordinal: u64, chunk_seq: u32) -> Self {
        Self {
            ordinal,
            chunk_seq,
            flags: FLAG_END_OF_RESPONSE,
            audio: Vec::new(),
        }
    }

    /// Whether this frame closes its response stream
    #[must_use]
    pub const fn is_end(&self) -> bool {
        self.flags & FLAG_END_OF_RESPONSE != 0
    }

    /// Encode to the binary wire layout
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUDIO_OUT_HEADER + self.audio.len());
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(&self.ordinal.to_be_bytes());
        buf.extend_from_slice(&self.chunk_seq.to_be_bytes());
        buf.push(self.flags);
        buf.extend_from_slice(&self.audio);
        buf
    }

    /// Decode from the binary wire layout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on truncation or version mismatch.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < AUDIO_OUT_HEADER {
            return Err(Error::Protocol(format!(
                "response frame too short: {} bytes",
                payload.len()
            )));
        }
        if payload[0] != WIRE_VERSION {
            return Err(Error::Protocol(format!(
                "unknown response frame version {}",
                payload[0]
            )));
        }
        let ordinal = u64::from_be_bytes(payload[1..9].try_into().map_err(|_| {
            Error::Protocol("response frame header truncated".to_string())
        })?);
        let chunk_seq = u32::from_be_bytes(payload[9..13].try_into().map_err(|_| {
            Error::Protocol("response frame header truncated".to_string())
        })?);
        Ok(Self {
            ordinal,
            chunk_seq,
            flags: payload[13],
            audio: payload[AUDIO_OUT_HEADER..].to_vec(),
        })
    }
}

/// Listening directives a device can send alongside its audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    /// Begin capturing (device-initiated, e.g. button press)
    Start,
    /// Stop capturing; an open utterance is force-closed
    Stop,
    /// Wake word detected locally
    Detect,
}

/// Control-plane messages from device to server (`device/{id}/control/in`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlIn {
    /// Connection handshake: credentials plus requested audio parameters
    Hello {
        /// Protocol version the firmware speaks
        version: u32,
        /// Opaque device token verified by the auth provider
        token: String,
        /// Requested audio parameters; server echoes the negotiated values
        #[serde(default)]
        audio_params: Option<AudioParams>,
        /// Firmware version currently running on the device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        firmware_version: Option<String>,
    },
    /// Explicit disconnect
    Goodbye,
    /// Listening directive
    Listen {
        /// What the device wants the capture state to be
        state: ListenState,
        /// Wake word text on `detect`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Abort the in-flight response (e.g. wake word re-detected mid-reply)
    Abort {
        /// Firmware-reported reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Peripheral report: capability descriptors on connect, state updates
    /// as they change
    Iot {
        /// Schema for the device's attached peripherals
        #[serde(default, skip_serializing_if = "Option::is_none")]
        descriptors: Option<serde_json::Value>,
        /// Current peripheral states
        #[serde(default, skip_serializing_if = "Option::is_none")]
        states: Option<serde_json::Value>,
    },
}

/// Control-plane messages from server to device (`device/{id}/control/out`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlOut {
    /// Handshake acknowledgment with the negotiated audio parameters
    HelloAck {
        /// Server-assigned session id (new on connect, stable across resume)
        session_id: String,
        /// Negotiated audio parameters
        audio_params: AudioParams,
    },
    /// Server-initiated or echoed disconnect
    Goodbye,
    /// Device must hold off new capture (a firmware transfer is in flight)
    Busy {
        /// Suggested retry delay
        retry_after_ms: u64,
    },
    /// One utterance's pipeline failed; the session stays alive
    StageError {
        /// Ordinal of the aborted utterance
        ordinal: u64,
        /// Which stage failed
        stage: PipelineStage,
        /// Human-readable detail
        message: String,
    },
    /// Protocol-level complaint (unexpected message for the session state)
    Error {
        /// Human-readable detail
        message: String,
    },
}

/// OTA messages from server to device (`device/{id}/ota/out`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OtaOut {
    /// Firmware offer; device answers with `accept` to start the transfer
    Offer {
        /// Server-assigned job id
        job_id: String,
        /// Target firmware version
        version: String,
        /// Total image size in bytes
        size: u64,
        /// Hex-encoded SHA-256 of the full image
        sha256: String,
        /// Chunk payload size the transfer will use
        chunk_size: u32,
    },
    /// One firmware chunk, base64-encoded
    Chunk {
        /// Job this chunk belongs to
        job_id: String,
        /// Zero-based chunk index
        index: u32,
        /// Base64 chunk payload
        data: String,
    },
    /// Job terminated by the server (operator cancel or retry exhaustion)
    Cancelled {
        /// Job that was cancelled
        job_id: String,
        /// Why
        reason: String,
    },
}

/// OTA messages from device to server (`device/{id}/ota/in`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OtaIn {
    /// Device accepts the offered job
    Accept {
        /// Job being accepted
        job_id: String,
    },
    /// Device has durably written the chunk
    ChunkAck {
        /// Job the ack belongs to
        job_id: String,
        /// Chunk index being acknowledged
        index: u32,
    },
    /// Device verified and applied the image
    Applied {
        /// Job that completed
        job_id: String,
        /// Digest the device computed over its flashed image, when the
        /// firmware supports reporting it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    /// Device-side failure (flash error, checksum mismatch on its end)
    Failed {
        /// Job that failed
        job_id: String,
        /// Firmware-reported reason
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_round_trip() {
        let frame = AudioFrame {
            seq: 42,
            captured_at_ms: 1_700_000_000_123,
            pcm: vec![0, -1, 32_000, -32_000],
        };
        let decoded = AudioFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn audio_frame_rejects_bad_version() {
        let mut bytes = AudioFrame {
            seq: 1,
            captured_at_ms: 0,
            pcm: vec![0; 4],
        }
        .encode();
        bytes[0] = 9;
        assert!(AudioFrame::decode(&bytes).is_err());
    }

    #[test]
    fn audio_frame_rejects_truncation() {
        assert!(AudioFrame::decode(&[1, 0, 0]).is_err());
    }

    #[test]
    fn response_frame_end_marker() {
        let marker = ResponseFrame::end_marker(7, 12);
        assert!(marker.is_end());
        let decoded = ResponseFrame::decode(&marker.encode()).unwrap();
        assert_eq!(decoded, marker);
        assert!(decoded.audio.is_empty());
    }

    #[test]
    fn hello_parses_with_audio_params() {
        let json = r#"{"type":"hello","version":1,"token":"abc","audio_params":{"sample_rate":16000,"frame_ms":20}}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        match msg {
            ControlIn::Hello {
                version,
                audio_params,
                ..
            } => {
                assert_eq!(version, 1);
                assert_eq!(audio_params.unwrap().frame_ms, 20);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn hello_parses_without_audio_params() {
        let json = r#"{"type":"hello","version":1,"token":"abc"}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ControlIn::Hello { audio_params: None, .. }));
    }

    #[test]
    fn listen_detect_carries_wake_word() {
        let json = r#"{"type":"listen","state":"detect","text":"hey ember"}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ControlIn::Listen {
                state: ListenState::Detect,
                text: Some("hey ember".to_string()),
            }
        );
    }

    #[test]
    fn iot_report_parses_with_partial_fields() {
        let json = r#"{"type":"iot","descriptors":[{"name":"lamp","methods":["on","off"]}]}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ControlIn::Iot {
                descriptors: Some(_),
                states: None,
            }
        ));

        let json = r#"{"type":"iot","states":{"lamp":"on"}}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ControlIn::Iot {
                descriptors: None,
                states: Some(_),
            }
        ));
    }

    #[test]
    fn ota_offer_round_trips() {
        let offer = OtaOut::Offer {
            job_id: "job-1".to_string(),
            version: "1.2.0".to_string(),
            size: 4096,
            sha256: "ab".repeat(32),
            chunk_size: 1024,
        };
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert_eq!(serde_json::from_str::<OtaOut>(&json).unwrap(), offer);
    }

    #[test]
    fn default_audio_params_are_16k_20ms() {
        let params = AudioParams::default();
        assert_eq!(params.samples_per_frame(), 320);
    }
}
