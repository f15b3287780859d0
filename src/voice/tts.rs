//! Text-to-speech (TTS) processing

use std::time::Duration;

use async_trait::async_trait;

use crate::persona::VoiceSettings;
use crate::{Error, Result};

const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const ELEVENLABS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Shortest text worth a synthesis call
pub const MIN_TEXT_CHARS: usize = 3;

/// Synthesis capability consumed by the pipeline
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize text into encoded audio (MP3)
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for text outside the provider's length bounds,
    /// or a transport error from the provider
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

impl TtsProvider {
    /// Parse a provider name
    ///
    /// # Errors
    ///
    /// Returns error for an unknown name
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }

    /// Longest text the provider accepts in one request
    #[must_use]
    pub const fn max_chars(self) -> usize {
        match self {
            Self::OpenAI => 4096,
            Self::ElevenLabs => 2000,
        }
    }
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    endpoint: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, voice: String, speed: f32, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            voice,
            speed,
            model,
            endpoint: OPENAI_SPEECH_URL.to_string(),
            provider: TtsProvider::OpenAI,
        })
    }

    /// Create a new TTS instance using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: String, voice_id: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            voice: voice_id,
            speed: 1.0,
            model,
            endpoint: ELEVENLABS_URL.to_string(),
            provider: TtsProvider::ElevenLabs,
        })
    }

    /// Use a different endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    #[must_use]
    pub const fn provider(&self) -> TtsProvider {
        self.provider
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            voice_settings: ElevenLabsVoice,
        }

        #[derive(serde::Serialize)]
        struct ElevenLabsVoice {
            stability: f32,
            similarity_boost: f32,
            style: f32,
            use_speaker_boost: bool,
        }

        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), self.voice);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
            voice_settings: ElevenLabsVoice {
                stability: voice.stability,
                similarity_boost: voice.similarity_boost,
                style: voice.style,
                use_speaker_boost: voice.use_speaker_boost,
            },
        };

        let response = self
            .client
            .post(&url)
            .query(&[
                ("output_format", "mp3_44100_128"),
                ("optimize_streaming_latency", "1"),
            ])
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, voice: &VoiceSettings) -> Result<Vec<u8>> {
        let text = validate_text(text, self.provider.max_chars())?;

        let started = std::time::Instant::now();
        let audio = match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice).await,
        }?;

        tracing::debug!(
            chars = text.chars().count(),
            audio_bytes = audio.len(),
            tts_ms = started.elapsed().as_millis(),
            "synthesis complete"
        );
        Ok(audio)
    }
}

/// Trim and bound-check text before any network call
///
/// # Errors
///
/// Returns `InvalidInput` when the text is too short or too long
pub fn validate_text(text: &str, max_chars: usize) -> Result<&str> {
    let text = text.trim();
    let chars = text.chars().count();

    if chars < MIN_TEXT_CHARS {
        return Err(Error::InvalidInput(format!(
            "text too short for synthesis ({chars} chars)"
        )));
    }
    if chars > max_chars {
        return Err(Error::InvalidInput(format!(
            "text too long for synthesis ({chars} > {max_chars} chars)"
        )));
    }
    Ok(text)
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?)
}
