//! HTTP collaborator implementations
//!
//! Concrete [`SpeechToText`], [`ResponseGenerator`], and [`TextToSpeech`]
//! backends over the `OpenAI` and Deepgram APIs, selected via configuration.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use super::{AudioStream, Collaborators, ContextEntry, ResponseGenerator, SpeechToText, TextToSpeech};
use crate::config::{ProvidersConfig, SttBackend};
use crate::error::PipelineStage;
use crate::{Error, Result};

/// Response from the `OpenAI` Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from the Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Speech-to-text over HTTP (Whisper or Deepgram)
#[derive(Debug)]
pub struct HttpSpeechToText {
    client: reqwest::Client,
    backend: SttBackend,
    api_key: String,
    model: String,
}

impl HttpSpeechToText {
    /// Create an STT client for the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key for the backend is missing
    pub fn new(backend: SttBackend, api_key: Option<String>, model: String) -> Result<Self> {
        let api_key = api_key.ok_or_else(|| {
            Error::Config(format!("API key required for {backend:?} transcription"))
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            backend,
            api_key,
            model,
        })
    }

    async fn transcribe_whisper(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::stage(PipelineStage::Transcription, e))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::stage(PipelineStage::Transcription, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::stage(
                PipelineStage::Transcription,
                format!("Whisper API error {status}: {body}"),
            ));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .map_err(|e| Error::stage(PipelineStage::Transcription, e))?;
        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav.to_vec())
            .send()
            .await
            .map_err(|e| Error::stage(PipelineStage::Transcription, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::stage(
                PipelineStage::Transcription,
                format!("Deepgram API error {status}: {body}"),
            ));
        }

        let result: DeepgramResponse = response
            .json()
            .await
            .map_err(|e| Error::stage(PipelineStage::Transcription, e))?;
        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();
        tracing::debug!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        match self.backend {
            SttBackend::Whisper => self.transcribe_whisper(wav).await,
            SttBackend::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(serde::Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Response generation over the `OpenAI` chat completions API
pub struct ChatResponder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl ChatResponder {
    /// Create a responder
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(api_key: Option<String>, model: String, system_prompt: String) -> Result<Self> {
        let api_key = api_key
            .ok_or_else(|| Error::Config("OpenAI API key required for responses".to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            system_prompt,
        })
    }
}

#[async_trait]
impl ResponseGenerator for ChatResponder {
    async fn respond(&self, text: &str, context: &[ContextEntry]) -> Result<String> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: &self.system_prompt,
        }];
        for entry in context {
            messages.push(ChatMessage {
                role: "user",
                content: &entry.user,
            });
            messages.push(ChatMessage {
                role: "assistant",
                content: &entry.assistant,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: text,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&ChatRequest {
                model: &self.model,
                messages,
            })
            .send()
            .await
            .map_err(|e| Error::stage(PipelineStage::Generation, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::stage(
                PipelineStage::Generation,
                format!("chat API error {status}: {body}"),
            ));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::stage(PipelineStage::Generation, e))?;
        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::stage(PipelineStage::Generation, "empty completion"))
    }
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

/// Text-to-speech over the `OpenAI` speech API, streamed as raw PCM chunks
pub struct StreamingTts {
    client: reqwest::Client,
    api_key: String,
    model: String,
    voice: String,
}

impl StreamingTts {
    /// Create a TTS client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(api_key: Option<String>, model: String, voice: String) -> Result<Self> {
        let api_key = api_key
            .ok_or_else(|| Error::Config("OpenAI API key required for speech".to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            voice,
        })
    }
}

#[async_trait]
impl TextToSpeech for StreamingTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        tracing::debug!(chars = text.len(), "starting synthesis");

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                // Raw PCM so chunks can be framed straight onto audio/out
                response_format: "pcm",
            })
            .send()
            .await
            .map_err(|e| Error::stage(PipelineStage::Synthesis, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::stage(
                PipelineStage::Synthesis,
                format!("speech API error {status}: {body}"),
            ));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| Error::stage(PipelineStage::Synthesis, e))
            })
            .boxed();
        Ok(stream)
    }
}

/// Build the collaborator set from configuration
///
/// # Errors
///
/// Returns error if a required API key is missing
pub fn build(config: &ProvidersConfig) -> Result<Collaborators> {
    let stt_key = match config.stt_backend {
        SttBackend::Whisper => config.openai_api_key.clone(),
        SttBackend::Deepgram => config.deepgram_api_key.clone(),
    };
    Ok(Collaborators {
        stt: Arc::new(HttpSpeechToText::new(
            config.stt_backend,
            stt_key,
            config.stt_model.clone(),
        )?),
        responder: Arc::new(ChatResponder::new(
            config.openai_api_key.clone(),
            config.chat_model.clone(),
            config.system_prompt.clone(),
        )?),
        tts: Arc::new(StreamingTts::new(
            config.openai_api_key.clone(),
            config.tts_model.clone(),
            config.tts_voice.clone(),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_config_error() {
        let err =
            HttpSpeechToText::new(SttBackend::Whisper, None, "whisper-1".to_string()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn build_requires_backend_key() {
        let config = ProvidersConfig {
            stt_backend: SttBackend::Deepgram,
            openai_api_key: Some("sk-test".to_string()),
            deepgram_api_key: None,
            ..ProvidersConfig::default()
        };
        assert!(build(&config).is_err());

        let config = ProvidersConfig {
            stt_backend: SttBackend::Whisper,
            openai_api_key: Some("sk-test".to_string()),
            ..ProvidersConfig::default()
        };
        assert!(build(&config).is_ok());
    }
}
