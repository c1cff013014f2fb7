//! Ember Gateway - MQTT voice backend for embedded assistant devices
//!
//! This library provides the core functionality of the Ember gateway:
//! - Real-time voice sessions over MQTT (segmentation, STT, response
//!   generation, TTS) for ESP32-class devices
//! - Strict per-device response ordering across concurrent pipelines
//! - Over-the-air firmware delivery with chunk acknowledgment and
//!   checkpointing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 MQTT Broker                          │
//! │   device/{id}/audio|control|ota/in|out  │  admin    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Ember Gateway                        │
//! │   Daemon  │  Registry  │  Sessions  │  OTA Jobs     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │            Collaborators (HTTP)                      │
//! │   STT  │  Response Generation  │  TTS               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ota;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod segmenter;
pub mod session;
pub mod transport;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, PipelineStage, Result};
pub use protocol::DeviceId;
pub use registry::{PresenceSnapshot, Registry};
pub use session::{SessionHandle, SessionState};
