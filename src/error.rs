//! Error types for the Ember gateway

use thiserror::Error;

/// Result type alias for Ember operations
pub type Result<T> = std::result::Result<T, Error>;

/// A dialogue pipeline stage, named in stage-failure reports sent to devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Speech-to-text transcription
    Transcription,
    /// Response generation
    Generation,
    /// Speech synthesis
    Synthesis,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transcription => write!(f, "transcription"),
            Self::Generation => write!(f, "generation"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Errors that can occur in the Ember gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Broker unreachable, publish failure, or malformed topic
    #[error("transport error: {0}")]
    Transport(String),

    /// Device credentials rejected; no session is created
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed or out-of-order audio; the offending frame is dropped
    #[error("segmentation error: {0}")]
    Segmentation(String),

    /// STT, response generation, or synthesis failure; aborts one utterance
    #[error("pipeline stage {stage} failed: {message}")]
    PipelineStage {
        /// Which stage failed
        stage: PipelineStage,
        /// Collaborator-reported detail
        message: String,
    },

    /// Firmware checksum or chunk acknowledgment mismatch
    #[error("ota integrity error: {0}")]
    OtaIntegrity(String),

    /// Unexpected message for the current session state
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Audio encoding error
    #[error("audio error: {0}")]
    Audio(String),
}

impl Error {
    /// Build a [`Error::PipelineStage`] from a stage and any displayable cause
    #[must_use]
    pub fn stage(stage: PipelineStage, cause: impl std::fmt::Display) -> Self {
        Self::PipelineStage {
            stage,
            message: cause.to_string(),
        }
    }
}
