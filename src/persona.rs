//! Persona configuration
//!
//! A persona carries the assistant's script: base system prompt, spoken-style
//! guidelines, chat defaults, named voice presets and the phrases the
//! assistant is known to say (used to recognise its own voice on the mic).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the preset every persona must define
pub const DEFAULT_PRESET: &str = "default";

/// Embedded personas compiled into the binary
const EMBEDDED_PERSONAS: &[(&str, &str)] = &[("selin", include_str!("../personas/selin.json"))];

/// Identity and script of the assistant
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Primary language (BCP 47 code), also the STT language hint
    #[serde(default = "default_language")]
    pub language: String,

    /// Base system prompt
    #[serde(default)]
    pub system_prompt: String,

    /// Rules for spoken output
    #[serde(default)]
    pub voice_guidelines: VoiceGuidelines,

    /// Chat generation defaults
    #[serde(default)]
    pub chat: ChatDefaults,

    /// Provider voice identifier (`ElevenLabs` voice id or `OpenAI` voice name)
    pub voice_id: Option<String>,

    /// Substrings of the assistant's own script
    #[serde(default)]
    pub echo_fingerprints: Vec<String>,

    /// Named voice presets
    #[serde(default)]
    pub presets: HashMap<String, VoicePreset>,
}

/// Spoken-style guidelines appended to the system prompt
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceGuidelines {
    #[serde(default)]
    pub sentence_structure: String,
}

/// Chat generation defaults
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ChatDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// A named speaking style
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePreset {
    /// Human-readable name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Appended to the system prompt
    #[serde(default)]
    pub style_instructions: String,

    /// Synthesis voice parameters
    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

/// Synthesis voice parameters (`ElevenLabs` semantics)
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.4,
            similarity_boost: 0.9,
            style: 0.85,
            use_speaker_boost: true,
        }
    }
}

fn default_language() -> String {
    "tr".to_string()
}

const fn default_max_tokens() -> u32 {
    500
}

const fn default_temperature() -> f32 {
    0.7
}

impl Persona {
    /// Parse a persona from JSON and validate it
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the persona has no default preset
    pub fn from_json(json: &str) -> Result<Self> {
        let persona: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse persona: {e}")))?;
        persona.validate()?;
        Ok(persona)
    }

    /// Load a persona from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let persona = Self::from_json(&content)?;
        tracing::info!(path = %path.display(), persona = %persona.id, "loaded persona from file");
        Ok(persona)
    }

    /// Load a persona compiled into the binary
    ///
    /// # Errors
    ///
    /// Returns error if the id is unknown
    pub fn embedded(id: &str) -> Result<Self> {
        let (_, json) = EMBEDDED_PERSONAS
            .iter()
            .find(|(embedded_id, _)| *embedded_id == id)
            .ok_or_else(|| Error::NotFound(format!("persona {id}")))?;
        Self::from_json(json)
    }

    /// The persona used when nothing else is configured
    ///
    /// # Errors
    ///
    /// Returns error if the embedded data is corrupt
    pub fn default_embedded() -> Result<Self> {
        Self::embedded("selin")
    }

    fn validate(&self) -> Result<()> {
        if !self.presets.contains_key(DEFAULT_PRESET) {
            return Err(Error::Config(format!(
                "persona {} has no '{DEFAULT_PRESET}' preset",
                self.id
            )));
        }
        Ok(())
    }

    /// Resolve a preset by name, falling back to the default preset
    #[must_use]
    pub fn preset(&self, name: &str) -> &VoicePreset {
        if let Some(preset) = self.presets.get(name) {
            return preset;
        }

        tracing::warn!(preset = name, "unknown voice preset, using default");
        match self.presets.get(DEFAULT_PRESET) {
            Some(preset) => preset,
            None => fallback_preset(),
        }
    }
}

fn fallback_preset() -> &'static VoicePreset {
    static FALLBACK: std::sync::OnceLock<VoicePreset> = std::sync::OnceLock::new();
    FALLBACK.get_or_init(VoicePreset::default)
}
