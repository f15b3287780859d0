//! Configuration management for murmur
//!
//! Values are layered env > TOML file > persona > defaults.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::chat::ChatProvider;
use crate::db::Identity;
use crate::persona::{DEFAULT_PRESET, Persona};
use crate::pipeline::PipelineConfig;
use crate::voice::{SttProvider, TtsProvider};
use crate::{Error, Result};

use self::file::FileConfig;

/// Default API server port
pub const DEFAULT_PORT: u16 = 18791;

/// Database file name inside the data directory
const DB_FILE: &str = "murmur.db";

/// Murmur configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Assistant persona
    pub persona: Persona,

    /// Local session identity
    pub identity: Identity,

    /// Path to data directory (database)
    pub data_dir: PathBuf,

    pub stt: SttConfig,
    pub chat: ChatConfig,
    pub tts: TtsConfig,
    pub pipeline: PipelineConfig,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub provider: SttProvider,
    /// e.g. "whisper-1", "nova-2"
    pub model: String,
    /// Language hint (BCP 47)
    pub language: String,
}

/// Chat streaming configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub provider: ChatProvider,
    /// Endpoint override; required for a relay
    pub endpoint: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub model: String,
    /// `ElevenLabs` voice id or `OpenAI` voice name
    pub voice: String,
    /// Speed multiplier (`OpenAI` only)
    pub speed: f32,
    /// Voice preset name
    pub preset: String,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Run alongside a talk session
    pub enabled: bool,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, chat, TTS)
    pub openai: Option<String>,

    /// `ElevenLabs` API key
    pub elevenlabs: Option<String>,

    /// `Deepgram` API key
    pub deepgram: Option<String>,

    /// Bearer key for a relay chat endpoint
    pub relay: Option<String>,
}

/// Options for [`Config::load_with_options`]
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Config file to read instead of the standard path
    pub config_path: Option<PathBuf>,

    /// Never start the HTTP surface alongside a session
    pub disable_server: bool,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be loaded or a value is invalid
    pub fn load() -> Result<Self> {
        Self::load_with_options(&LoadOptions::default())
    }

    /// Load configuration with explicit options
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be loaded or a value is invalid
    pub fn load_with_options(options: &LoadOptions) -> Result<Self> {
        let fc = options
            .config_path
            .as_deref()
            .map_or_else(file::load_config_file, file::load_from);

        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let persona = match env("MURMUR_PERSONA_FILE") {
            Some(path) => Persona::load_file(&PathBuf::from(path))?,
            None => Persona::default_embedded()?,
        };

        let mut config = Self::resolve(fc, persona, &env)?;
        if options.disable_server {
            config.api_server.enabled = false;
        }

        std::fs::create_dir_all(&config.data_dir)?;
        Ok(config)
    }

    /// Layer `env` over the file config over the persona over defaults
    ///
    /// # Errors
    ///
    /// Returns error for an unknown provider name or a missing voice
    pub fn resolve(
        fc: FileConfig,
        persona: Persona,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            relay: env("MURMUR_RELAY_KEY").or(fc.api_keys.relay),
        };

        let identity = Identity {
            id: env("MURMUR_USER_ID")
                .or(fc.user.id)
                .unwrap_or_else(|| "local".to_string()),
            name: env("MURMUR_USER_NAME").or(fc.user.name),
            email: env("MURMUR_USER_EMAIL").or(fc.user.email),
        };

        // STT (env > toml > persona > default)
        let stt_provider = SttProvider::parse(
            &env("MURMUR_STT_PROVIDER")
                .or(fc.stt.provider)
                .unwrap_or_else(|| "whisper".to_string()),
        )?;
        let stt = SttConfig {
            provider: stt_provider,
            model: env("MURMUR_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or_else(|| default_stt_model(stt_provider).to_string()),
            language: env("MURMUR_LANGUAGE")
                .or(fc.stt.language)
                .unwrap_or_else(|| persona.language.clone()),
        };

        // Chat (env > toml > persona > default)
        let chat = ChatConfig {
            provider: ChatProvider::parse(
                &env("MURMUR_CHAT_PROVIDER")
                    .or(fc.chat.provider)
                    .unwrap_or_else(|| "openai".to_string()),
            )?,
            endpoint: env("MURMUR_CHAT_ENDPOINT").or(fc.chat.endpoint),
            model: env("MURMUR_LLM_MODEL")
                .or(fc.chat.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_tokens: fc.chat.max_tokens.unwrap_or(persona.chat.max_tokens),
            temperature: fc.chat.temperature.unwrap_or(persona.chat.temperature),
        };
        if chat.provider == ChatProvider::Relay && chat.endpoint.is_none() {
            return Err(Error::Config(
                "relay chat provider needs MURMUR_CHAT_ENDPOINT".to_string(),
            ));
        }

        // TTS (env > toml > persona > default)
        let tts_provider = TtsProvider::parse(
            &env("MURMUR_TTS_PROVIDER")
                .or(fc.tts.provider)
                .unwrap_or_else(|| "elevenlabs".to_string()),
        )?;
        let voice = env("MURMUR_TTS_VOICE").or(fc.tts.voice);
        let voice = match tts_provider {
            TtsProvider::ElevenLabs => voice.or_else(|| persona.voice_id.clone()).ok_or_else(|| {
                Error::Config("ElevenLabs needs a voice id (MURMUR_TTS_VOICE)".to_string())
            })?,
            TtsProvider::OpenAI => voice.unwrap_or_else(|| "alloy".to_string()),
        };
        let tts = TtsConfig {
            provider: tts_provider,
            model: env("MURMUR_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or_else(|| default_tts_model(tts_provider).to_string()),
            voice,
            speed: fc.tts.speed.unwrap_or(1.0),
            preset: env("MURMUR_VOICE_PRESET")
                .or(fc.tts.preset)
                .unwrap_or_else(|| DEFAULT_PRESET.to_string()),
        };

        let pipeline = pipeline_config(&fc.pipeline);

        // API server config (env > toml > default)
        let api_server = ApiServerConfig {
            port: env("MURMUR_API_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            enabled: fc.server.enabled.unwrap_or(true),
        };

        // Data directory (~/.local/share/murmur on Linux)
        let data_dir = env("MURMUR_DATA_DIR").map_or_else(
            || {
                directories::BaseDirs::new()
                    .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("murmur"))
            },
            PathBuf::from,
        );

        tracing::debug!(
            persona = %persona.id,
            stt = ?stt.provider,
            chat = ?chat.provider,
            tts = ?tts.provider,
            "configuration resolved"
        );

        Ok(Self {
            persona,
            identity,
            data_dir,
            stt,
            chat,
            tts,
            pipeline,
            api_server,
            api_keys,
        })
    }

    /// Path of the conversation database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    /// Key for the configured STT provider
    ///
    /// # Errors
    ///
    /// Returns error if the key is not configured
    pub fn stt_key(&self) -> Result<String> {
        match self.stt.provider {
            SttProvider::Whisper => require(self.api_keys.openai.as_ref(), "OPENAI_API_KEY"),
            SttProvider::Deepgram => require(self.api_keys.deepgram.as_ref(), "DEEPGRAM_API_KEY"),
        }
    }

    /// Key for the configured TTS provider
    ///
    /// # Errors
    ///
    /// Returns error if the key is not configured
    pub fn tts_key(&self) -> Result<String> {
        match self.tts.provider {
            TtsProvider::OpenAI => require(self.api_keys.openai.as_ref(), "OPENAI_API_KEY"),
            TtsProvider::ElevenLabs => {
                require(self.api_keys.elevenlabs.as_ref(), "ELEVENLABS_API_KEY")
            }
        }
    }
}

fn require(key: Option<&String>, name: &str) -> Result<String> {
    key.cloned()
        .ok_or_else(|| Error::Config(format!("{name} not set")))
}

const fn default_stt_model(provider: SttProvider) -> &'static str {
    match provider {
        SttProvider::Whisper => "whisper-1",
        SttProvider::Deepgram => "nova-2",
    }
}

const fn default_tts_model(provider: TtsProvider) -> &'static str {
    match provider {
        TtsProvider::ElevenLabs => "eleven_multilingual_v2",
        TtsProvider::OpenAI => "tts-1",
    }
}

fn pipeline_config(fc: &file::PipelineFileConfig) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    let ms = Duration::from_millis;

    let mut config = defaults.clone();
    config.capture.max_duration = fc.capture_max_ms.map_or(defaults.capture.max_duration, ms);
    config.capture.chunk_interval = fc.capture_chunk_ms.map(ms);
    config.capture.energy_threshold = fc
        .energy_threshold
        .unwrap_or(defaults.capture.energy_threshold);
    config.capture.end_silence_ms = fc.end_silence_ms.unwrap_or(defaults.capture.end_silence_ms);
    config.capture.min_speech_ms = fc.min_speech_ms.unwrap_or(defaults.capture.min_speech_ms);
    config.echo_window = fc.echo_window_ms.map_or(defaults.echo_window, ms);
    config.min_transcript_chars = fc
        .min_transcript_chars
        .unwrap_or(defaults.min_transcript_chars);
    config.segmenter.min_sentences = fc
        .segment_min_sentences
        .unwrap_or(defaults.segmenter.min_sentences);
    config.segmenter.char_threshold = fc
        .segment_char_threshold
        .unwrap_or(defaults.segmenter.char_threshold);
    config.segmenter.max_wait = fc
        .segment_max_wait_ms
        .map_or(defaults.segmenter.max_wait, ms);
    config.segmenter.flush_min_chars = fc
        .flush_min_chars
        .unwrap_or(defaults.segmenter.flush_min_chars);
    config.playback.overlap = fc
        .playback_overlap_ms
        .map_or(defaults.playback.overlap, ms);
    config.playback.idle_grace = fc
        .playback_idle_grace_ms
        .map_or(defaults.playback.idle_grace, ms);
    config.synthesis_concurrency = fc
        .synthesis_concurrency
        .unwrap_or(defaults.synthesis_concurrency)
        .max(1);
    config.history_window = fc.history_window.unwrap_or(defaults.history_window);
    config
}
