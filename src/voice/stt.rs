//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;

use super::capture::AudioChunk;
use crate::{Error, Result};

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";

/// Whisper reports no confidence; this is advisory only
const WHISPER_CONFIDENCE: f32 = 0.95;

/// Recognized text of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
    pub duration_secs: Option<f32>,
    pub language: Option<String>,
}

/// Transcription capability consumed by the pipeline
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one chunk
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails; there is no retry
    async fn transcribe(&self, chunk: &AudioChunk) -> Result<Transcription>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    duration: Option<f32>,
    language: Option<String>,
}

/// Response from Deepgram transcription API
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
    #[serde(default)]
    confidence: Option<f32>,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

impl SttProvider {
    /// Parse a provider name
    ///
    /// # Errors
    ///
    /// Returns error for an unknown name
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Transcribes speech to text
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
    endpoint: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_whisper(api_key: String, model: String, language: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            language,
            endpoint: WHISPER_URL.to_string(),
            provider: SttProvider::Whisper,
        })
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: String, model: String, language: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            language,
            endpoint: DEEPGRAM_URL.to_string(),
            provider: SttProvider::Deepgram,
        })
    }

    /// Use a different endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, chunk: &AudioChunk) -> Result<Transcription> {
        tracing::debug!(audio_bytes = chunk.bytes.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(chunk.bytes.clone())
                    .file_name(file_name(&chunk.mime_type))
                    .mime_str(&chunk.mime_type)
                    .map_err(|e| Error::InvalidInput(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "verbose_json")
            .text("temperature", "0");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        Ok(Transcription {
            text: result.text.trim().to_string(),
            confidence: WHISPER_CONFIDENCE,
            duration_secs: result.duration,
            language: result.language,
        })
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, chunk: &AudioChunk) -> Result<Transcription> {
        tracing::debug!(audio_bytes = chunk.bytes.len(), "starting Deepgram transcription");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("model", self.model.as_str()),
                ("punctuate", "true"),
                ("language", self.language.as_str()),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", chunk.mime_type.as_str())
            .body(chunk.bytes.clone())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Deepgram response");
            e
        })?;

        let alternative = result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next());

        Ok(alternative.map_or_else(
            || Transcription {
                text: String::new(),
                confidence: 0.0,
                duration_secs: None,
                language: None,
            },
            |a| Transcription {
                text: a.transcript.trim().to_string(),
                confidence: a.confidence.unwrap_or(WHISPER_CONFIDENCE),
                duration_secs: None,
                language: Some(self.language.clone()),
            },
        ))
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, chunk: &AudioChunk) -> Result<Transcription> {
        let started = std::time::Instant::now();
        let result = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(chunk).await,
            SttProvider::Deepgram => self.transcribe_deepgram(chunk).await,
        }?;

        tracing::info!(
            transcript = %result.text,
            confidence = result.confidence,
            stt_ms = started.elapsed().as_millis(),
            "transcription complete"
        );
        Ok(result)
    }
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?)
}

/// Upload file name matching the container type
fn file_name(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    match essence {
        "audio/webm" => "audio.webm",
        "audio/ogg" => "audio.ogg",
        "audio/mpeg" | "audio/mp3" => "audio.mp3",
        "audio/mp4" | "audio/m4a" => "audio.m4a",
        _ => "audio.wav",
    }
}
