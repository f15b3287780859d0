//! Voice processing module
//!
//! Microphone capture with end-of-utterance detection, provider STT and TTS,
//! MP3 decoding and gapless playback.

mod capture;
mod decode;
mod playback;
mod stt;
mod tts;
mod vad;

pub use capture::{
    AudioCapture, AudioChunk, CaptureConfig, CaptureStream, CpalMicrophone, DeviceGuard,
    InputDevice, SAMPLE_RATE, WAV_MIME, samples_to_wav,
};
pub use decode::{AudioDecoder, Mp3Decoder, resample};
pub use playback::{
    PLAYBACK_SAMPLE_RATE, PlayableAudio, PlaybackClock, PlaybackConfig, PlaybackScheduler,
    ScheduledSpan, Timeline,
};
pub use stt::{SpeechToText, SttProvider, Transcriber, Transcription};
pub use tts::{MIN_TEXT_CHARS, Synthesizer, TextToSpeech, TtsProvider, validate_text};
pub use vad::{SpeechDetector, calculate_energy};
