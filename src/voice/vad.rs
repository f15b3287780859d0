//! Energy-based end-of-utterance detection

/// Detects the end of an utterance by trailing silence
pub struct SpeechDetector {
    threshold: f32,
    min_speech_samples: usize,
    end_silence_samples: usize,
    speech_samples: usize,
    silence_samples: usize,
    heard_speech: bool,
}

impl SpeechDetector {
    /// Create a detector for `sample_rate` Hz audio
    #[must_use]
    pub fn new(threshold: f32, min_speech_ms: u64, end_silence_ms: u64, sample_rate: u32) -> Self {
        let samples = |ms: u64| {
            usize::try_from(ms * u64::from(sample_rate) / 1000).unwrap_or(usize::MAX)
        };

        Self {
            threshold,
            min_speech_samples: samples(min_speech_ms),
            end_silence_samples: samples(end_silence_ms),
            speech_samples: 0,
            silence_samples: 0,
            heard_speech: false,
        }
    }

    /// Feed samples; returns true once enough speech was followed by silence
    pub fn process(&mut self, samples: &[f32]) -> bool {
        let energy = calculate_energy(samples);

        if energy > self.threshold {
            self.speech_samples += samples.len();
            self.silence_samples = 0;
            if !self.heard_speech && self.speech_samples >= self.min_speech_samples {
                self.heard_speech = true;
                tracing::trace!(energy, "speech detected");
            }
        } else if self.speech_samples > 0 {
            self.silence_samples += samples.len();
        }

        if self.heard_speech && self.silence_samples >= self.end_silence_samples {
            tracing::debug!(
                speech = self.speech_samples,
                silence = self.silence_samples,
                "utterance complete"
            );
            return true;
        }

        false
    }

    /// Whether enough speech was heard to count as an utterance
    #[must_use]
    pub const fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    /// Start over for the next utterance
    pub const fn reset(&mut self) {
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.heard_speech = false;
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
