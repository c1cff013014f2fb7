//! Configuration for the Ember gateway
//!
//! Loaded from an optional TOML file with environment-variable overrides for
//! secrets. Every field has a default so a bare `ember` starts against a
//! local broker.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MQTT broker connection
    pub mqtt: MqttConfig,

    /// Voice activity segmentation tuning
    pub segmenter: SegmenterConfig,

    /// Session lifecycle tuning
    pub session: SessionConfig,

    /// OTA transfer tuning
    pub ota: OtaConfig,

    /// STT / response / TTS collaborator selection
    pub providers: ProvidersConfig,

    /// Shared secret for device token verification
    /// Set via `EMBER_DEVICE_SECRET`
    pub device_secret: Option<String>,

    /// Data directory (OTA checkpoint database); defaults to the XDG data dir
    pub data_dir: Option<PathBuf>,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client id presented to the broker
    pub client_id: String,

    /// Broker username
    pub username: Option<String>,

    /// Broker password (`EMBER_MQTT_PASSWORD` overrides)
    pub password: Option<String>,

    /// Keepalive interval in seconds
    pub keepalive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "ember-gateway".to_string(),
            username: None,
            password: None,
            keepalive_secs: 90,
        }
    }
}

/// Voice activity segmentation tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// RMS energy above which a frame counts as speech (i16 full scale)
    pub energy_threshold: f32,

    /// Sliding window length, in frames, for energy smoothing
    pub window_frames: usize,

    /// Consecutive non-speech frames required to close an utterance
    pub hangover_frames: usize,

    /// Hard cap on utterance duration before a forced close
    pub max_utterance_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 700.0,
            window_frames: 3,
            hangover_frames: 25,
            max_utterance_ms: 15_000,
        }
    }
}

/// Session lifecycle tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a suspended session stays resumable after transport loss
    pub grace_period_secs: u64,

    /// Tear down a session after this much inactivity
    pub idle_timeout_secs: u64,

    /// Protocol violations tolerated before the session is closed
    pub violation_limit: u32,

    /// Rolling conversation context entries kept per session
    pub context_window: usize,

    /// Audio frames buffered while an OTA hold is asserted
    pub hold_queue_frames: usize,

    /// Retry delay suggested in `busy` control frames
    pub busy_retry_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            idle_timeout_secs: 300,
            violation_limit: 5,
            context_window: 12,
            hold_queue_frames: 256,
            busy_retry_ms: 2_000,
        }
    }
}

/// OTA transfer tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Chunk payload size in bytes
    pub chunk_size: u32,

    /// How long to wait for a chunk acknowledgment before retransmitting
    pub ack_timeout_ms: u64,

    /// Retransmissions per chunk before the job fails
    pub max_chunk_retries: u32,

    /// Firmware image to offer to out-of-date devices
    pub firmware_path: Option<PathBuf>,

    /// Version the image at `firmware_path` carries
    pub firmware_version: Option<String>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4_096,
            ack_timeout_ms: 5_000,
            max_chunk_retries: 3,
            firmware_path: None,
            firmware_version: None,
        }
    }
}

/// Which STT backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttBackend {
    /// `OpenAI` Whisper
    #[default]
    Whisper,
    /// Deepgram
    Deepgram,
}

/// Collaborator (STT / response generation / TTS) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// STT backend selection
    pub stt_backend: SttBackend,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// Chat model for response generation
    pub chat_model: String,

    /// System prompt prepended to response generation
    pub system_prompt: String,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// `OpenAI` API key (`EMBER_OPENAI_API_KEY` overrides)
    pub openai_api_key: Option<String>,

    /// Deepgram API key (`EMBER_DEEPGRAM_API_KEY` overrides)
    pub deepgram_api_key: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            stt_backend: SttBackend::Whisper,
            stt_model: "whisper-1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful voice assistant. Answer briefly.".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            openai_api_key: None,
            deepgram_api_key: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                let parsed: Self = toml::from_str(&raw)?;
                tracing::info!(path = %p.display(), "configuration loaded");
                parsed
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment-variable overrides for secrets
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("EMBER_MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Ok(v) = std::env::var("EMBER_OPENAI_API_KEY") {
            self.providers.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("EMBER_DEEPGRAM_API_KEY") {
            self.providers.deepgram_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("EMBER_DEVICE_SECRET") {
            self.device_secret = Some(v);
        }
    }

    /// Resolve the data directory, creating it if needed
    ///
    /// Uses `~/.local/share/ember/` when not set explicitly.
    #[must_use]
    pub fn resolve_data_dir(&self) -> PathBuf {
        let dir = self.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "ember", "ember")
                .map_or_else(|| PathBuf::from(".ember"), |d| d.data_dir().to_path_buf())
        });
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to create data directory");
        }
        dir
    }
}
