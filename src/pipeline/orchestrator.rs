//! Conversation orchestrator
//!
//! Drives one turn at a time through capture, transcription, chat streaming,
//! segmentation, synthesis and playback. A new turn supersedes the previous
//! one: its cancellation token fires and anything it still produces is
//! discarded as stale.

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::echo::{EchoGuard, InputFilter};
use super::segmenter::{TextSegment, TextSegmenter};
use super::state::{PipelineHandle, ResponseId, Stage};
use super::synthesis::run_ordered;
use super::PipelineConfig;
use crate::chat::{ChatBackend, ChatRequest, TokenStream};
use crate::db::{Conversation, ConversationStore, Identity, TurnRole};
use crate::error::ErrorKind;
use crate::persona::{ChatDefaults, DEFAULT_PRESET, Persona};
use crate::prompt::{build_system_prompt, history_window};
use crate::voice::{
    AudioCapture, AudioDecoder, InputDevice, PlaybackClock, PlaybackScheduler, Synthesizer,
    Transcriber,
};
use crate::{Error, Result};

/// Segments buffered between the token reader and synthesis
const SEGMENT_QUEUE: usize = 32;

/// External capabilities the pipeline drives
pub struct Collaborators {
    pub device: Arc<dyn InputDevice>,
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatBackend>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub decoder: Arc<dyn AudioDecoder>,
    pub store: Arc<dyn ConversationStore>,
    pub clock: PlaybackClock,
}

/// Outcome of a completed turn
#[derive(Debug, Clone)]
pub struct Reply {
    pub response_id: ResponseId,
    pub conversation_id: String,
    /// Full reply text as streamed
    pub text: String,
    /// Segments synthesized and handed to playback
    pub segments: usize,
    /// Segments dropped after a synthesis failure
    pub failed_segments: usize,
}

/// Where a transcript came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Microphone,
    Typed,
}

/// Builder for an [`Orchestrator`]
pub struct OrchestratorBuilder {
    collaborators: Collaborators,
    persona: Persona,
    preset: String,
    identity: Identity,
    config: PipelineConfig,
    chat: Option<ChatDefaults>,
    state: Option<PipelineHandle>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new(collaborators: Collaborators, persona: Persona, identity: Identity) -> Self {
        Self {
            collaborators,
            persona,
            preset: DEFAULT_PRESET.to_string(),
            identity,
            config: PipelineConfig::default(),
            chat: None,
            state: None,
        }
    }

    /// Select a voice preset by name
    #[must_use]
    pub fn preset(mut self, name: impl Into<String>) -> Self {
        self.preset = name.into();
        self
    }

    /// Set the pipeline tunables
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the persona's chat defaults
    #[must_use]
    pub const fn chat_defaults(mut self, chat: ChatDefaults) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Share an existing state handle (e.g. with the HTTP surface)
    #[must_use]
    pub fn state(mut self, state: PipelineHandle) -> Self {
        self.state = Some(state);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the playback device cannot be opened
    pub fn build(self) -> Result<Orchestrator> {
        let state = self.state.unwrap_or_default();
        let Collaborators {
            device,
            transcriber,
            chat,
            synthesizer,
            decoder,
            store,
            clock,
        } = self.collaborators;

        let playback =
            PlaybackScheduler::new(clock, decoder, self.config.playback, state.clone())?;
        let capture = AudioCapture::new(device, self.config.capture.clone(), state.clone());

        if !self.persona.presets.contains_key(&self.preset) {
            tracing::warn!(preset = %self.preset, "unknown voice preset, using default");
        }

        tracing::info!(
            persona = %self.persona.id,
            preset = %self.preset,
            user = %self.identity.id,
            "pipeline ready"
        );

        Ok(Orchestrator {
            echo: EchoGuard::new(self.config.echo_window),
            filter: InputFilter::new(
                self.config.min_transcript_chars,
                &self.persona.echo_fingerprints,
            ),
            chat_defaults: self.chat.unwrap_or(self.persona.chat),
            persona: self.persona,
            preset: self.preset,
            identity: self.identity,
            config: self.config,
            state,
            capture,
            playback,
            transcriber,
            chat,
            synthesizer,
            store,
            conversation: Mutex::new(None),
        })
    }
}

/// Top-level state machine of one conversation session
pub struct Orchestrator {
    state: PipelineHandle,
    capture: AudioCapture,
    playback: PlaybackScheduler,
    transcriber: Arc<dyn Transcriber>,
    chat: Arc<dyn ChatBackend>,
    synthesizer: Arc<dyn Synthesizer>,
    store: Arc<dyn ConversationStore>,
    persona: Persona,
    preset: String,
    identity: Identity,
    chat_defaults: ChatDefaults,
    config: PipelineConfig,
    echo: EchoGuard,
    filter: InputFilter,
    conversation: Mutex<Option<String>>,
}

impl Orchestrator {
    #[must_use]
    pub const fn state(&self) -> &PipelineHandle {
        &self.state
    }

    #[must_use]
    pub const fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Capture one utterance and answer it
    ///
    /// Returns `Ok(None)` when the capture heard no speech.
    ///
    /// # Errors
    ///
    /// `Busy` if a capture cannot start now; `DeviceUnavailable`, transport
    /// and input errors abort the turn. `SelfEchoSuppressed` and
    /// `StaleResult` are silent outcomes the caller should not surface.
    pub async fn listen(&self) -> Result<Option<Reply>> {
        let mut stream = self.capture.start_capture().map_err(|e| self.settle(e))?;

        let mut texts = Vec::new();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next_chunk().await.map_err(|e| self.settle(e))? {
            chunks += 1;
            let started = Instant::now();
            let transcription = self
                .transcriber
                .transcribe(&chunk)
                .await
                .map_err(|e| self.settle(e))?;

            tracing::debug!(
                chunk = chunks,
                confidence = transcription.confidence,
                stt_ms = started.elapsed().as_millis(),
                "chunk transcribed"
            );
            if !transcription.text.trim().is_empty() {
                texts.push(transcription.text);
            }
        }
        drop(stream);

        if chunks == 0 {
            return Ok(None);
        }

        let transcript = texts.join(" ");
        self.handle_transcript(&transcript, Source::Microphone)
            .await
            .map(Some)
    }

    /// Stop the active capture; safe when none is active
    pub fn stop_listening(&self) -> bool {
        self.capture.stop_capture()
    }

    /// Answer a typed utterance
    ///
    /// Supersedes any response in flight. Typed text cannot be acoustic echo,
    /// so only the sanity filter applies.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::listen`] after transcription
    pub async fn submit_text(&self, text: &str) -> Result<Reply> {
        self.handle_transcript(text, Source::Typed).await
    }

    /// Current conversation of the session user
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub fn history(&self) -> Result<Conversation> {
        let conversation = self.store.fetch_current(&self.identity.id)?;
        self.remember(&conversation.id);
        Ok(conversation)
    }

    /// Cancel everything in flight and clear the conversation
    ///
    /// Without a known current conversation every conversation of the user
    /// is cleared.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub fn clear(&self) -> Result<()> {
        self.capture.stop_capture();
        self.playback.stop();
        self.state.reset();

        let cached = self
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.store.clear(&self.identity.id, cached.as_deref())?;

        tracing::info!(conversation = ?cached, "conversation cleared");
        Ok(())
    }

    async fn handle_transcript(&self, text: &str, source: Source) -> Result<Reply> {
        if source == Source::Microphone {
            let snapshot = self.state.snapshot();
            self.echo
                .check(&snapshot, Instant::now(), text)
                .map_err(|e| self.settle(e))?;
        }

        let prompt = self.filter.accept(text).map_err(|e| self.settle(e))?;

        if source == Source::Microphone {
            self.state.note_user_speech(Instant::now());
        }
        tracing::info!(source = ?source, transcript = %prompt, "user turn accepted");

        self.respond(prompt).await
    }

    async fn respond(&self, prompt: String) -> Result<Reply> {
        let turn_started = Instant::now();
        let (id, cancel) = self.state.begin_response();
        self.playback.stop();

        let (conversation_id, history) = self
            .context()
            .map_err(|e| self.settle_response(id, e))?;
        let conversation_id = self
            .store
            .append(&self.identity.id, Some(&conversation_id), TurnRole::User, &prompt)
            .map_err(|e| self.settle_response(id, e))?;

        self.state.set_stage_for(id, Stage::Generating);

        let preset = self.persona.preset(&self.preset);
        let request = ChatRequest {
            prompt,
            system_prompt: build_system_prompt(&self.persona, preset, Some(&self.identity)),
            history,
            max_tokens: self.chat_defaults.max_tokens,
            temperature: self.chat_defaults.temperature,
        };

        let tokens = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(stale(id)),
            result = self.chat.stream_chat(&request) => {
                result.map_err(|e| self.settle_response(id, e))?
            }
        };

        let (tx, rx) = mpsc::channel(SEGMENT_QUEUE);
        let producer = self.read_tokens(id, tokens, tx, cancel.clone(), turn_started);

        let voice = preset.voice_settings;
        let consumer = run_ordered(
            self.synthesizer.as_ref(),
            &voice,
            self.config.synthesis_concurrency,
            rx,
            &cancel,
            |segment, audio| {
                let playback = self.playback.clone();
                let state = self.state.clone();
                async move {
                    if !state.is_current(id) {
                        tracing::debug!(segment = %segment.source_id, "dropping stale audio");
                        return;
                    }
                    match playback
                        .enqueue_while(audio, &segment.content, || state.is_current(id))
                        .await
                    {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            tracing::debug!(segment = %segment.source_id, "audio not scheduled");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, segment = %segment.source_id, "enqueue failed");
                        }
                    }
                }
            },
        );

        let ((text, stream_error), report) = tokio::join!(producer, consumer);
        self.state.finish_response(id);

        if cancel.is_cancelled() || !self.state.is_current(id) {
            return Err(stale(id));
        }

        let conversation_id = if text.trim().is_empty() {
            tracing::warn!(response = %id, "empty reply not persisted");
            conversation_id
        } else {
            self.store
                .append(
                    &self.identity.id,
                    Some(&conversation_id),
                    TurnRole::Assistant,
                    &text,
                )
                .map_err(|e| self.settle_response(id, e))?
        };
        self.remember(&conversation_id);

        if !self.playback.wait_until_idle(&cancel).await {
            tracing::debug!(response = %id, "playback wait cut short");
        }

        if let Some(error) = stream_error {
            return Err(self.settle_response(id, error));
        }

        let completed = self.state.complete_turn(id);
        tracing::info!(
            response = %id,
            chars = text.chars().count(),
            segments = report.synthesized,
            failed = report.failed,
            completed,
            turn_ms = turn_started.elapsed().as_millis(),
            "turn complete"
        );

        Ok(Reply {
            response_id: id,
            conversation_id,
            text,
            segments: report.synthesized,
            failed_segments: report.failed,
        })
    }

    /// Read the token stream into segments until it ends, fails or the
    /// response is cancelled
    ///
    /// Returns the full text read and the stream error, if any.
    async fn read_tokens(
        &self,
        id: ResponseId,
        mut tokens: TokenStream,
        tx: mpsc::Sender<TextSegment>,
        cancel: CancellationToken,
        turn_started: Instant,
    ) -> (String, Option<Error>) {
        let mut segmenter = TextSegmenter::new(self.config.segmenter, id.to_string());
        let mut text = String::new();
        let mut stream_error = None;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = tokens.next() => next,
            };

            match next {
                Some(Ok(token)) => {
                    if text.is_empty() {
                        tracing::info!(
                            first_token_ms = turn_started.elapsed().as_millis(),
                            "first token"
                        );
                    }
                    text.push_str(&token);
                    for segment in segmenter.feed(&token) {
                        if tx.send(segment).await.is_err() {
                            tracing::debug!("synthesis closed, segment dropped");
                        }
                    }
                }
                Some(Err(e)) => {
                    stream_error = Some(e);
                    break;
                }
                None => break,
            }
        }

        if !cancel.is_cancelled() {
            if let Some(segment) = segmenter.flush() {
                if tx.send(segment).await.is_err() {
                    tracing::debug!("synthesis closed, final segment dropped");
                }
            }
        }
        (text, stream_error)
    }

    /// Current conversation id and the chat context window
    fn context(&self) -> Result<(String, Vec<crate::chat::ChatMessage>)> {
        let conversation = self.store.fetch_current(&self.identity.id)?;
        self.remember(&conversation.id);
        Ok((
            conversation.id,
            history_window(&conversation.turns, self.config.history_window),
        ))
    }

    fn remember(&self, conversation_id: &str) {
        *self
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(conversation_id.to_string());
    }

    /// Apply an error outside any response to the state
    ///
    /// A rejected input never aborts a response already in flight.
    fn settle(&self, error: Error) -> Error {
        match error.kind() {
            ErrorKind::SelfEchoSuppressed | ErrorKind::StaleResult => {
                tracing::debug!(error = %error, "input discarded");
                self.state.end_transcribing();
            }
            ErrorKind::Busy => {
                tracing::info!(error = %error, "request refused");
            }
            _ if self.state.snapshot().active_response_id.is_some() => {
                tracing::warn!(error = %error, "input rejected");
            }
            _ => self.state.fail(&error),
        }
        error
    }

    /// Apply an error of response `id` to the state
    fn settle_response(&self, id: ResponseId, error: Error) -> Error {
        if error.is_silent() {
            tracing::debug!(response = %id, error = %error, "response discarded");
        } else {
            self.state.fail_response(id, &error);
        }
        error
    }
}

fn stale(id: ResponseId) -> Error {
    tracing::debug!(response = %id, "response superseded, result discarded");
    Error::StaleResult(id.0)
}
