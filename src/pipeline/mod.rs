//! Realtime conversation pipeline
//!
//! capture → transcribe → chat stream → segment → synthesize → play, with the
//! shared state that keeps the microphone and the speaker from overlapping.

mod echo;
mod orchestrator;
mod segmenter;
mod state;
mod synthesis;

use std::time::Duration;

pub use echo::{EchoGuard, InputFilter};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorBuilder, Reply};
pub use segmenter::{SegmenterConfig, TextSegment, TextSegmenter};
pub use state::{PipelineHandle, PipelineState, ResponseId, Stage, Status};
pub use synthesis::{ReorderBuffer, SynthesisReport, run_ordered};

use crate::voice::{CaptureConfig, PlaybackConfig};

/// Pipeline tunables
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub segmenter: SegmenterConfig,
    pub playback: PlaybackConfig,
    /// Transcriptions this soon after user speech are echo while speaking
    pub echo_window: Duration,
    pub min_transcript_chars: usize,
    /// Synthesis requests in flight per response
    pub synthesis_concurrency: usize,
    /// Prior turns sent as chat context
    pub history_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            segmenter: SegmenterConfig::default(),
            playback: PlaybackConfig::default(),
            echo_window: Duration::from_millis(5000),
            min_transcript_chars: 2,
            synthesis_concurrency: 1,
            history_window: 20,
        }
    }
}
