//! Shared test utilities
//!
//! Scripted stand-ins for the microphone and the provider backends, so the
//! whole pipeline runs without audio hardware or network access.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, mpsc};

use murmur::chat::{ChatBackend, ChatRequest, TokenStream};
use murmur::db::{self, ConversationRepo, Identity};
use murmur::persona::{Persona, VoiceSettings};
use murmur::pipeline::{Collaborators, Orchestrator, OrchestratorBuilder, PipelineConfig};
use murmur::voice::{
    AudioChunk, AudioDecoder, DeviceGuard, InputDevice, PlaybackClock, SAMPLE_RATE, Synthesizer,
    Transcriber, Transcription,
};
use murmur::{DbPool, Error, Result};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Identity used by pipeline tests
#[must_use]
pub fn test_identity() -> Identity {
    Identity {
        id: "user-1".to_string(),
        name: Some("Ayşe".to_string()),
        email: Some("ayse@example.com".to_string()),
    }
}

/// Half a second of speech followed by a second of silence
#[must_use]
pub fn utterance() -> Vec<Vec<f32>> {
    let rate = SAMPLE_RATE as usize;
    vec![vec![0.3; rate / 2], vec![0.0; rate]]
}

/// Microphone replaying scripted sample blocks
#[derive(Default)]
pub struct FakeMicrophone {
    blocks: Mutex<Vec<Vec<f32>>>,
    pub opened: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    #[must_use]
    pub fn with_blocks(blocks: Vec<Vec<f32>>) -> Self {
        Self {
            blocks: Mutex::new(blocks),
            ..Self::default()
        }
    }

    pub fn script(&self, blocks: Vec<Vec<f32>>) {
        *self.blocks.lock().unwrap() = blocks;
    }
}

impl InputDevice for FakeMicrophone {
    fn open(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<DeviceGuard> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        for block in self.blocks.lock().unwrap().iter() {
            sink.send(block.clone()).unwrap();
        }
        let released = Arc::clone(&self.released);
        Ok(DeviceGuard::new(move || {
            released.fetch_add(1, Ordering::SeqCst);
            drop(sink);
        }))
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// Transcriber answering from a queue of texts
#[derive(Default)]
pub struct FakeTranscriber {
    texts: Mutex<VecDeque<Result<String>>>,
    pub calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn push(&self, text: &str) {
        self.texts.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn push_error(&self, error: Error) {
        self.texts.lock().unwrap().push_back(Err(error));
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _chunk: &AudioChunk) -> Result<Transcription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .texts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))?;
        Ok(Transcription {
            text,
            confidence: 0.9,
            duration_secs: None,
            language: Some("tr".to_string()),
        })
    }
}

/// One scripted chat reply
#[derive(Debug, Clone, Default)]
pub struct ChatScript {
    pub tokens: Vec<String>,
    /// Pause before each token
    pub delay: Duration,
    /// Transport failure after all tokens
    pub fail_after: bool,
    /// Non-success status before any token
    pub reject: bool,
}

impl ChatScript {
    #[must_use]
    pub fn tokens(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.fail_after = true;
        self
    }
}

/// Chat backend replaying one script per request
#[derive(Default)]
pub struct FakeChat {
    scripts: Mutex<VecDeque<ChatScript>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChat {
    pub fn push(&self, script: ChatScript) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

#[async_trait]
impl ChatBackend for FakeChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        if script.reject {
            return Err(Error::Chat("status 401".to_string()));
        }

        let delay = script.delay;
        let mut items: Vec<Result<String>> = script.tokens.into_iter().map(Ok).collect();
        if script.fail_after {
            items.push(Err(Error::Chat("connection reset".to_string())));
        }

        let stream = futures::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}

/// Synthesizer returning the text bytes as "audio"
///
/// Texts containing a failing marker get a server error.
#[derive(Default)]
pub struct FakeSynth {
    pub fail_marker: Option<String>,
    /// Only texts containing this marker are delayed; all are when unset
    pub slow_marker: Option<String>,
    pub delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSynth {
    #[must_use]
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn slow_on(marker: &str, delay: Duration) -> Self {
        Self {
            slow_marker: Some(marker.to_string()),
            delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(&self, text: &str, _voice: &VoiceSettings) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        let slow = self
            .slow_marker
            .as_deref()
            .is_none_or(|marker| text.contains(marker));
        if slow && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self
            .fail_marker
            .as_deref()
            .is_some_and(|marker| text.contains(marker))
        {
            return Err(Error::Tts("status 500: upstream error".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Decoder producing 10 ms of tone per payload byte
pub struct FakeDecoder;

impl AudioDecoder for FakeDecoder {
    fn decode(&self, bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
        if bytes.is_empty() {
            return Err(Error::Audio("empty payload".to_string()));
        }
        let frames = bytes.len() * target_rate as usize / 100;
        Ok(vec![0.1; frames])
    }
}

/// Decoder that holds payloads containing `marker` until released
pub struct GatedDecoder {
    marker: Vec<u8>,
    /// Signalled when a held payload starts decoding
    pub started: Notify,
    released: Mutex<bool>,
    gate: Condvar,
}

impl GatedDecoder {
    #[must_use]
    pub fn holding(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            started: Notify::new(),
            released: Mutex::new(false),
            gate: Condvar::new(),
        }
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.gate.notify_all();
    }
}

impl AudioDecoder for GatedDecoder {
    fn decode(&self, bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
        if bytes.windows(self.marker.len()).any(|w| w == self.marker) {
            self.started.notify_one();
            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.gate.wait(released).unwrap();
            }
        }
        FakeDecoder.decode(bytes, target_rate)
    }
}

/// A pipeline wired to fakes
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub microphone: Arc<FakeMicrophone>,
    pub transcriber: Arc<FakeTranscriber>,
    pub chat: Arc<FakeChat>,
    pub synth: Arc<FakeSynth>,
    pub conversations: ConversationRepo,
    pub db: DbPool,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::with(FakeSynth::default(), PipelineConfig::default())
    }

    #[must_use]
    pub fn with(synth: FakeSynth, config: PipelineConfig) -> Self {
        Self::with_decoder(synth, config, Arc::new(FakeDecoder))
    }

    #[must_use]
    pub fn with_decoder(
        synth: FakeSynth,
        config: PipelineConfig,
        decoder: Arc<dyn AudioDecoder>,
    ) -> Self {
        let db = setup_test_db();
        let conversations = ConversationRepo::new(db.clone());
        let microphone = Arc::new(FakeMicrophone::default());
        let transcriber = Arc::new(FakeTranscriber::default());
        let chat = Arc::new(FakeChat::default());
        let synth = Arc::new(synth);

        let collaborators = Collaborators {
            device: microphone.clone(),
            transcriber: transcriber.clone(),
            chat: chat.clone(),
            synthesizer: synth.clone(),
            decoder,
            store: Arc::new(conversations.clone()),
            clock: PlaybackClock::Virtual,
        };

        let persona = Persona::default_embedded().expect("embedded persona");
        let orchestrator = OrchestratorBuilder::new(collaborators, persona, test_identity())
            .config(config)
            .build()
            .expect("orchestrator");

        Self {
            orchestrator,
            microphone,
            transcriber,
            chat,
            synth,
            conversations,
            db,
        }
    }
}
