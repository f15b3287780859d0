//! TOML configuration file loading
//!
//! Supports `~/.config/murmur/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Local session identity
    pub user: UserFileConfig,

    /// Speech-to-text provider
    pub stt: SttFileConfig,

    /// Chat streaming provider
    pub chat: ChatFileConfig,

    /// Text-to-speech provider
    pub tts: TtsFileConfig,

    /// Pipeline tunables
    pub pipeline: PipelineFileConfig,

    /// HTTP surface
    pub server: ServerFileConfig,

    /// API keys for external services
    pub api_keys: ApiKeysFileConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserFileConfig {
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SttFileConfig {
    /// "whisper" or "deepgram"
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Language hint, defaults to the persona language
    pub language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatFileConfig {
    /// "openai" or "relay"
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TtsFileConfig {
    /// "elevenlabs" or "openai"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    /// Voice preset name
    pub preset: Option<String>,
}

/// Pipeline tunables; durations in milliseconds
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PipelineFileConfig {
    pub capture_max_ms: Option<u64>,
    pub capture_chunk_ms: Option<u64>,
    pub energy_threshold: Option<f32>,
    pub end_silence_ms: Option<u64>,
    pub min_speech_ms: Option<u64>,
    pub echo_window_ms: Option<u64>,
    pub min_transcript_chars: Option<usize>,
    pub segment_min_sentences: Option<usize>,
    pub segment_char_threshold: Option<usize>,
    pub segment_max_wait_ms: Option<u64>,
    pub flush_min_chars: Option<usize>,
    pub playback_overlap_ms: Option<u64>,
    pub playback_idle_grace_ms: Option<u64>,
    pub synthesis_concurrency: Option<usize>,
    pub history_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Run the HTTP surface alongside a talk session
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
    /// Bearer key for a relay chat endpoint
    pub relay: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `FileConfig::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> FileConfig {
    config_file_path().map_or_else(FileConfig::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> FileConfig {
    if !path.exists() {
        return FileConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                FileConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            FileConfig::default()
        }
    }
}

/// Return the config file path: `~/.config/murmur/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("murmur").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[tts]\nprovider = \"openai\"\nspeed = 1.2\n\n[pipeline]\necho_window_ms = 3000\n"
        )
        .unwrap();

        let config = load_from(file.path());
        assert_eq!(config.tts.provider.as_deref(), Some("openai"));
        assert_eq!(config.tts.speed, Some(1.2));
        assert_eq!(config.pipeline.echo_window_ms, Some(3000));
        assert!(config.stt.provider.is_none());
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();

        let config = load_from(file.path());
        assert!(config.server.port.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml"));
        assert!(config.user.id.is_none());
    }
}
