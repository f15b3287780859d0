//! Session - wires configuration to a running pipeline
//!
//! Builds the provider clients, the conversation store and the orchestrator,
//! then drives them from the console while the HTTP surface runs alongside.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::api::{ApiServer, ApiServerBuilder};
use crate::chat::{ChatBackend, ChatProvider, ChatStreamClient};
use crate::config::Config;
use crate::db::{self, ConversationRepo, DbPool, UserRepo};
use crate::pipeline::{Collaborators, Orchestrator, OrchestratorBuilder, PipelineHandle, Reply};
use crate::voice::{
    CpalMicrophone, Mp3Decoder, PlaybackClock, SpeechToText, SttProvider, Synthesizer,
    TextToSpeech, Transcriber, TtsProvider,
};
use crate::{Error, Result};

/// A line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    /// Empty line: start or stop listening
    Toggle,
    Clear,
    History,
    Quit,
    /// Anything else is a typed utterance
    Text(String),
}

impl ConsoleInput {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Self::Toggle,
            "/clear" => Self::Clear,
            "/history" => Self::History,
            "/quit" | "/exit" => Self::Quit,
            text => Self::Text(text.to_string()),
        }
    }
}

/// One configured murmur session
pub struct Session {
    config: Config,
    db: DbPool,
}

impl Session {
    /// Open the database and record the local user
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be initialized
    pub fn new(config: Config) -> Result<Self> {
        let db_path = config.db_path();
        let db = db::init(&db_path)?;
        tracing::info!(path = %db_path.display(), "database opened");

        UserRepo::new(db.clone()).upsert(&config.identity)?;
        Ok(Self { config, db })
    }

    /// Session over an existing pool
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn with_pool(config: Config, db: DbPool) -> Self {
        Self { config, db }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn conversations(&self) -> ConversationRepo {
        ConversationRepo::new(self.db.clone())
    }

    /// Build the configured STT client
    ///
    /// # Errors
    ///
    /// Returns error if the provider key is missing
    pub fn transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        let stt = &self.config.stt;
        let key = self.config.stt_key()?;
        let client = match stt.provider {
            SttProvider::Whisper => {
                SpeechToText::new_whisper(key, stt.model.clone(), stt.language.clone())?
            }
            SttProvider::Deepgram => {
                SpeechToText::new_deepgram(key, stt.model.clone(), stt.language.clone())?
            }
        };
        Ok(Arc::new(client))
    }

    /// Build the configured chat client
    ///
    /// # Errors
    ///
    /// Returns error if the provider key or endpoint is missing
    pub fn chat(&self) -> Result<Arc<dyn ChatBackend>> {
        let chat = &self.config.chat;
        let client = match chat.provider {
            ChatProvider::OpenAi => {
                let key = self
                    .config
                    .api_keys
                    .openai
                    .clone()
                    .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?;
                let client = ChatStreamClient::new_openai(key, chat.model.clone())?;
                match &chat.endpoint {
                    Some(endpoint) => client.with_endpoint(endpoint.clone()),
                    None => client,
                }
            }
            ChatProvider::Relay => ChatStreamClient::new_relay(
                chat.endpoint.clone().unwrap_or_default(),
                self.config.api_keys.relay.clone(),
            )?,
        };
        Ok(Arc::new(client))
    }

    /// Build the configured TTS client
    ///
    /// # Errors
    ///
    /// Returns error if the provider key is missing
    pub fn synthesizer(&self) -> Result<Arc<dyn Synthesizer>> {
        let tts = &self.config.tts;
        let key = self.config.tts_key()?;
        let client = match tts.provider {
            TtsProvider::OpenAI => {
                TextToSpeech::new_openai(key, tts.voice.clone(), tts.speed, tts.model.clone())?
            }
            TtsProvider::ElevenLabs => {
                TextToSpeech::new_elevenlabs(key, tts.voice.clone(), tts.model.clone())?
            }
        };
        Ok(Arc::new(client))
    }

    /// Wire every collaborator and build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if a provider is misconfigured or the output device
    /// cannot be opened
    pub fn orchestrator(&self, state: PipelineHandle) -> Result<Orchestrator> {
        let collaborators = Collaborators {
            device: Arc::new(CpalMicrophone),
            transcriber: self.transcriber()?,
            chat: self.chat()?,
            synthesizer: self.synthesizer()?,
            decoder: Arc::new(Mp3Decoder),
            store: Arc::new(self.conversations()),
            clock: PlaybackClock::Device,
        };

        OrchestratorBuilder::new(
            collaborators,
            self.config.persona.clone(),
            self.config.identity.clone(),
        )
        .preset(self.config.tts.preset.clone())
        .config(self.config.pipeline.clone())
        .chat_defaults(crate::persona::ChatDefaults {
            max_tokens: self.config.chat.max_tokens,
            temperature: self.config.chat.temperature,
        })
        .state(state)
        .build()
    }

    /// HTTP surface over this session's store
    #[must_use]
    pub fn api_server(&self, pipeline: Option<PipelineHandle>) -> ApiServer {
        let builder = ApiServerBuilder::new(self.db.clone(), self.config.api_server.port)
            .persona_id(self.config.persona.id.clone());
        match pipeline {
            Some(handle) => builder.pipeline(handle),
            None => builder,
        }
        .build()
    }

    /// Serve the HTTP surface until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind
    pub async fn serve(self) -> Result<()> {
        let server = self.api_server(None).spawn();

        tokio::select! {
            result = server => {
                result.map_err(|e| Error::Config(format!("API server task failed: {e}")))??;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }
        Ok(())
    }

    /// Run an interactive talk session until `/quit` or interrupt
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline cannot be built or stdin fails
    pub async fn talk(self) -> Result<()> {
        let state = PipelineHandle::new();
        let orchestrator = Arc::new(self.orchestrator(state.clone())?);

        if self.config.api_server.enabled {
            let server = self.api_server(Some(state.clone())).spawn();
            tokio::spawn(async move {
                match server.await {
                    Ok(Err(e)) => tracing::error!(error = %e, "API server stopped"),
                    Err(e) => tracing::error!(error = %e, "API server task failed"),
                    Ok(Ok(())) => {}
                }
            });
        }

        let printer = spawn_status_printer(&state);
        let name = self.config.persona.name.clone();

        println!("{name} is ready.");
        println!("  <enter>    start / stop listening");
        println!("  <text>     type a message");
        println!("  /history   show the conversation");
        println!("  /clear     forget the conversation");
        println!("  /quit      exit\n");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut listener: Option<JoinHandle<()>> = None;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };

            match ConsoleInput::parse(&line) {
                ConsoleInput::Toggle => {
                    if orchestrator.stop_listening() {
                        continue;
                    }
                    if listener.as_ref().is_some_and(|task| !task.is_finished()) {
                        println!("(busy)");
                        continue;
                    }
                    let orchestrator = Arc::clone(&orchestrator);
                    let name = name.clone();
                    listener = Some(tokio::spawn(async move {
                        match orchestrator.listen().await {
                            Ok(Some(reply)) => print_reply(&name, &reply),
                            Ok(None) => println!("(no speech heard)"),
                            Err(e) => report(&e),
                        }
                    }));
                }
                ConsoleInput::Text(text) => {
                    let orchestrator = Arc::clone(&orchestrator);
                    let name = name.clone();
                    tokio::spawn(async move {
                        match orchestrator.submit_text(&text).await {
                            Ok(reply) => print_reply(&name, &reply),
                            Err(e) => report(&e),
                        }
                    });
                }
                ConsoleInput::History => match orchestrator.history() {
                    Ok(conversation) => {
                        if conversation.turns.is_empty() {
                            println!("(no messages)");
                        }
                        for turn in &conversation.turns {
                            println!(
                                "[{}] {}: {}",
                                turn.created_at.format("%H:%M"),
                                turn.role.as_str(),
                                turn.text
                            );
                        }
                    }
                    Err(e) => report(&e),
                },
                ConsoleInput::Clear => match orchestrator.clear() {
                    Ok(()) => println!("(conversation cleared)"),
                    Err(e) => report(&e),
                },
                ConsoleInput::Quit => break,
            }
        }

        orchestrator.stop_listening();
        orchestrator.playback().stop();
        state.reset();
        printer.abort();
        Ok(())
    }
}

fn spawn_status_printer(state: &PipelineHandle) -> JoinHandle<()> {
    let mut status = state.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let line = status.borrow_and_update().to_string();
            println!("· {line}");
        }
    })
}

fn print_reply(name: &str, reply: &Reply) {
    println!("{name}: {}", reply.text);
    if reply.failed_segments > 0 {
        println!("({} segment(s) could not be spoken)", reply.failed_segments);
    }
}

fn report(error: &Error) {
    if error.is_silent() {
        return;
    }
    println!("(error: {error})");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_input_parse() {
        assert_eq!(ConsoleInput::parse(""), ConsoleInput::Toggle);
        assert_eq!(ConsoleInput::parse("   "), ConsoleInput::Toggle);
        assert_eq!(ConsoleInput::parse("/clear"), ConsoleInput::Clear);
        assert_eq!(ConsoleInput::parse("/history "), ConsoleInput::History);
        assert_eq!(ConsoleInput::parse("/exit"), ConsoleInput::Quit);
        assert_eq!(
            ConsoleInput::parse(" Merhaba "),
            ConsoleInput::Text("Merhaba".to_string())
        );
    }
}
