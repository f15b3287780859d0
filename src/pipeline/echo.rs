//! Self-echo suppression
//!
//! Two independent heuristics keep the assistant from answering its own
//! voice: a timing guard while playback is active, and a denylist of phrases
//! from the assistant's script. Both are approximate and tunable.

use std::time::Duration;

use tokio::time::Instant;

use super::state::PipelineState;
use crate::{Error, Result};

/// Timing guard against the microphone hearing playback
#[derive(Debug, Clone, Copy)]
pub struct EchoGuard {
    window: Duration,
}

impl EchoGuard {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Check a transcription that arrived at `now`
    ///
    /// Suppressed iff the assistant is speaking and the last genuine user
    /// speech is less than the window ago. Exactly at the window it passes.
    ///
    /// # Errors
    ///
    /// Returns `SelfEchoSuppressed` when the transcription is presumed echo
    pub fn check(&self, state: &PipelineState, now: Instant, text: &str) -> Result<()> {
        if !state.is_assistant_speaking {
            return Ok(());
        }

        let Some(last) = state.last_user_speech_at else {
            return Ok(());
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.window {
            tracing::debug!(
                elapsed_ms = elapsed.as_millis(),
                window_ms = self.window.as_millis(),
                "transcription during playback suppressed"
            );
            return Err(Error::SelfEchoSuppressed(text.to_string()));
        }
        Ok(())
    }
}

/// Sanity filter applied to every transcript before chat
#[derive(Debug, Clone)]
pub struct InputFilter {
    min_chars: usize,
    fingerprints: Vec<String>,
}

impl InputFilter {
    #[must_use]
    pub fn new(min_chars: usize, fingerprints: &[String]) -> Self {
        Self {
            min_chars,
            fingerprints: fingerprints
                .iter()
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    /// Accept a transcript, returning it trimmed
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for empty or near-empty text and
    /// `SelfEchoSuppressed` when it contains a known assistant phrase
    pub fn accept(&self, text: &str) -> Result<String> {
        let text = text.trim();
        let chars = text.chars().count();

        if chars < self.min_chars {
            return Err(Error::InvalidInput(format!(
                "transcript too short ({chars} chars)"
            )));
        }

        let lowered = text.to_lowercase();
        if let Some(fingerprint) = self.fingerprints.iter().find(|f| lowered.contains(f.as_str())) {
            tracing::debug!(fingerprint, "transcript matches assistant phrasing");
            return Err(Error::SelfEchoSuppressed(text.to_string()));
        }

        Ok(text.to_string())
    }
}
