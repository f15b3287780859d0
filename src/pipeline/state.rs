//! Shared pipeline state
//!
//! All flags live behind one mutex so every check-and-set is atomic. The
//! lock is never held across an await; callers re-check after resuming.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Identifier of one assistant response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResponseId(pub u64);

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Mutual-exclusion flags of one conversation session
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub is_recording: bool,
    pub is_assistant_speaking: bool,
    pub is_processing: bool,
    pub last_user_speech_at: Option<Instant>,
    pub active_response_id: Option<ResponseId>,
}

/// Orchestrator stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Capturing,
    Transcribing,
    Generating,
    Speaking,
}

/// Human-readable status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Error(String),
}

impl From<Stage> for Status {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Idle => Self::Ready,
            Stage::Capturing => Self::Listening,
            Stage::Transcribing => Self::Transcribing,
            Stage::Generating => Self::Thinking,
            Stage::Speaking => Self::Speaking,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Listening => f.write_str("listening"),
            Self::Transcribing => f.write_str("transcribing"),
            Self::Thinking => f.write_str("thinking"),
            Self::Speaking => f.write_str("speaking"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

struct Inner {
    state: PipelineState,
    stage: Stage,
    capture_stop: Option<CancellationToken>,
    response_cancel: Option<CancellationToken>,
    next_response: u64,
}

/// Cloneable handle to the session state
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Mutex<Inner>>,
    status: Arc<watch::Sender<Status>>,
}

impl Default for PipelineHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHandle {
    #[must_use]
    pub fn new() -> Self {
        let (status, _) = watch::channel(Status::Ready);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: PipelineState::default(),
                stage: Stage::Idle,
                capture_stop: None,
                response_cancel: None,
                next_response: 0,
            })),
            status: Arc::new(status),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: Status) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::debug!(status = %status, "status changed");
            *current = status;
            true
        });
    }

    fn enter(&self, inner: &mut Inner, stage: Stage) {
        inner.stage = stage;
        self.publish(stage.into());
    }

    /// Copy of the current flags
    #[must_use]
    pub fn snapshot(&self) -> PipelineState {
        self.lock().state.clone()
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Current status line
    #[must_use]
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Move to a stage
    pub fn set_stage(&self, stage: Stage) {
        let mut inner = self.lock();
        self.enter(&mut inner, stage);
    }

    /// Move to a stage only while `id` is the active response
    pub fn set_stage_for(&self, id: ResponseId, stage: Stage) {
        let mut inner = self.lock();
        if inner.state.active_response_id == Some(id) {
            self.enter(&mut inner, stage);
        }
    }

    /// Claim the microphone
    ///
    /// # Errors
    ///
    /// Returns `Busy` while recording, transcribing, processing or speaking
    pub fn try_begin_recording(&self, stop: CancellationToken) -> Result<()> {
        let mut inner = self.lock();

        if inner.state.is_recording {
            return Err(Error::Busy("already recording"));
        }
        if inner.state.is_assistant_speaking {
            return Err(Error::Busy("assistant is speaking"));
        }
        if inner.state.is_processing {
            return Err(Error::Busy("assistant is processing"));
        }
        if inner.stage == Stage::Transcribing {
            return Err(Error::Busy("transcription in progress"));
        }

        inner.state.is_recording = true;
        inner.capture_stop = Some(stop);
        self.enter(&mut inner, Stage::Capturing);
        Ok(())
    }

    /// Mark the microphone released, moving on to `then` if still capturing
    pub fn end_recording(&self, then: Stage) {
        let mut inner = self.lock();
        if !inner.state.is_recording {
            return;
        }

        inner.state.is_recording = false;
        inner.capture_stop = None;
        if inner.stage == Stage::Capturing {
            self.enter(&mut inner, then);
        }
    }

    /// Signal the active capture to stop; returns whether one was active
    pub fn stop_recording(&self) -> bool {
        let inner = self.lock();
        inner.capture_stop.as_ref().map_or(false, |stop| {
            stop.cancel();
            true
        })
    }

    /// Stop capture because playback started
    pub fn force_stop_capture(&self) {
        if self.stop_recording() {
            tracing::warn!("playback started while recording, capture force-stopped");
        }
    }

    /// Leave the transcribing stage after a turn that produced no response
    pub fn end_transcribing(&self) {
        let mut inner = self.lock();
        if inner.stage != Stage::Transcribing {
            return;
        }
        let stage = if inner.state.is_assistant_speaking {
            Stage::Speaking
        } else {
            Stage::Idle
        };
        self.enter(&mut inner, stage);
    }

    /// Record when genuine user speech was accepted
    pub fn note_user_speech(&self, at: Instant) {
        self.lock().state.last_user_speech_at = Some(at);
    }

    /// Start a new response, superseding the active one
    ///
    /// The previous response's cancellation token fires.
    pub fn begin_response(&self) -> (ResponseId, CancellationToken) {
        let mut inner = self.lock();

        if let Some(previous) = inner.response_cancel.take() {
            previous.cancel();
            if let Some(old) = inner.state.active_response_id {
                tracing::debug!(response = %old, "response superseded");
            }
        }

        inner.next_response += 1;
        let id = ResponseId(inner.next_response);
        let cancel = CancellationToken::new();

        inner.state.active_response_id = Some(id);
        inner.state.is_processing = true;
        inner.response_cancel = Some(cancel.clone());
        (id, cancel)
    }

    /// Whether `id` is still the active response
    #[must_use]
    pub fn is_current(&self, id: ResponseId) -> bool {
        self.lock().state.active_response_id == Some(id)
    }

    /// All segments of `id` are handed to playback
    pub fn finish_response(&self, id: ResponseId) {
        let mut inner = self.lock();
        if inner.state.active_response_id == Some(id) {
            inner.state.is_processing = false;
        }
    }

    /// Turn fully completed; returns false if `id` was superseded meanwhile
    pub fn complete_turn(&self, id: ResponseId) -> bool {
        let mut inner = self.lock();
        if inner.state.active_response_id != Some(id) {
            return false;
        }

        inner.state.active_response_id = None;
        inner.state.is_processing = false;
        inner.response_cancel = None;
        let stage = if inner.state.is_assistant_speaking {
            Stage::Speaking
        } else {
            Stage::Idle
        };
        self.enter(&mut inner, stage);
        true
    }

    /// Playback entered or left the playing state
    pub fn set_speaking(&self, speaking: bool) {
        let mut inner = self.lock();
        if inner.state.is_assistant_speaking == speaking {
            return;
        }

        inner.state.is_assistant_speaking = speaking;
        if speaking {
            self.enter(&mut inner, Stage::Speaking);
        } else if inner.stage == Stage::Speaking {
            let stage = if inner.state.is_processing {
                Stage::Generating
            } else {
                Stage::Idle
            };
            self.enter(&mut inner, stage);
        }
    }

    /// Abort the turn with a reported error
    pub fn fail(&self, error: &Error) {
        let mut inner = self.lock();
        inner.state.is_processing = false;
        inner.state.active_response_id = None;
        inner.response_cancel = None;
        inner.stage = Stage::Idle;
        tracing::warn!(error = %error, "turn failed");
        self.publish(Status::Error(error.to_string()));
    }

    /// Abort response `id` with a reported error, unless it was superseded
    pub fn fail_response(&self, id: ResponseId, error: &Error) {
        if self.is_current(id) {
            self.fail(error);
        } else {
            tracing::debug!(response = %id, error = %error, "error from superseded response");
        }
    }

    /// Return to idle, cancelling capture and any response
    pub fn reset(&self) {
        let mut inner = self.lock();
        if let Some(stop) = inner.capture_stop.take() {
            stop.cancel();
        }
        if let Some(cancel) = inner.response_cancel.take() {
            cancel.cancel();
        }
        let last_user_speech_at = inner.state.last_user_speech_at;
        inner.state = PipelineState {
            last_user_speech_at,
            ..PipelineState::default()
        };
        self.enter(&mut inner, Stage::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(Status::Ready.to_string(), "ready");
        assert_eq!(Status::from(Stage::Capturing).to_string(), "listening");
        assert_eq!(Status::from(Stage::Generating).to_string(), "thinking");
        assert_eq!(
            Status::Error("capture unavailable: denied".into()).to_string(),
            "error: capture unavailable: denied"
        );
    }

    #[test]
    fn test_recording_refused_while_busy() {
        let state = PipelineHandle::new();

        state.set_speaking(true);
        let err = state.try_begin_recording(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert!(!state.snapshot().is_recording);

        state.set_speaking(false);
        let (_id, _cancel) = state.begin_response();
        let err = state.try_begin_recording(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[test]
    fn test_recording_claim_and_release() {
        let state = PipelineHandle::new();
        let stop = CancellationToken::new();

        state.try_begin_recording(stop.clone()).unwrap();
        assert_eq!(state.status(), Status::Listening);
        assert!(matches!(
            state.try_begin_recording(CancellationToken::new()),
            Err(Error::Busy(_))
        ));

        assert!(state.stop_recording());
        assert!(stop.is_cancelled());

        state.end_recording(Stage::Idle);
        assert!(!state.snapshot().is_recording);
        assert_eq!(state.stage(), Stage::Idle);

        // Nothing active: safe no-op
        assert!(!state.stop_recording());
        state.end_recording(Stage::Transcribing);
        assert_eq!(state.stage(), Stage::Idle);
    }

    #[test]
    fn test_begin_response_supersedes_previous() {
        let state = PipelineHandle::new();

        let (first, first_cancel) = state.begin_response();
        let (second, second_cancel) = state.begin_response();

        assert_ne!(first, second);
        assert!(first_cancel.is_cancelled());
        assert!(!second_cancel.is_cancelled());
        assert!(!state.is_current(first));
        assert!(state.is_current(second));

        // Superseded response cannot finish the new one
        state.finish_response(first);
        assert!(state.snapshot().is_processing);
        assert!(!state.complete_turn(first));
        assert!(state.complete_turn(second));
        assert!(state.snapshot().active_response_id.is_none());
    }

    #[test]
    fn test_speaking_transitions() {
        let state = PipelineHandle::new();
        let (id, _cancel) = state.begin_response();
        state.set_stage_for(id, Stage::Generating);

        state.set_speaking(true);
        assert_eq!(state.status(), Status::Speaking);

        // Still generating when playback drains
        state.set_speaking(false);
        assert_eq!(state.stage(), Stage::Generating);

        state.finish_response(id);
        assert!(state.complete_turn(id));
        assert_eq!(state.status(), Status::Ready);
    }

    #[test]
    fn test_superseded_failure_ignored() {
        let state = PipelineHandle::new();
        let (first, _) = state.begin_response();
        let (second, _) = state.begin_response();

        state.fail_response(first, &Error::Tts("late".into()));
        assert!(state.is_current(second));
        assert_eq!(state.status(), Status::Ready);
    }

    #[test]
    fn test_fail_returns_to_idle_with_error() {
        let state = PipelineHandle::new();
        let (_id, _cancel) = state.begin_response();

        state.fail(&Error::Chat("503".into()));
        let snapshot = state.snapshot();
        assert!(!snapshot.is_processing);
        assert!(snapshot.active_response_id.is_none());
        assert_eq!(state.stage(), Stage::Idle);
        assert_eq!(state.status().to_string(), "error: chat error: 503");

        // Recoverable: capture can start again
        state.try_begin_recording(CancellationToken::new()).unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let state = PipelineHandle::new();
        let mut rx = state.subscribe();

        state.set_stage(Stage::Transcribing);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Status::Transcribing);
    }
}
