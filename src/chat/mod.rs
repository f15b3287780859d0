//! Streaming chat client
//!
//! Exposes an LLM reply as a lazy, single-use sequence of text fragments.
//! Two wire shapes are understood: `OpenAI` chat completions (fragments in
//! `choices[0].delta.content`) and a relay that already emits the canonical
//! `{"text": "..."}` frame. Anything else on the wire is skipped.

pub mod sse;

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::db::TurnRole;
use crate::{Error, Result};
use sse::{SseDecoder, SseEvent};

/// Lazy token sequence; finite and not restartable
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// One prior turn sent as context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: TurnRole,
    pub content: String,
}

/// Everything needed to generate one reply
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Chat capability consumed by the pipeline
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a reply
    ///
    /// # Errors
    ///
    /// A non-success response fails here, before any token is produced.
    /// Transport failures after that arrive as an `Err` item in the stream.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream>;
}

/// Wire protocol of the chat endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatProvider {
    /// `OpenAI`-compatible chat completions with `stream: true`
    OpenAi,
    /// Relay emitting `data: {"text": ...}` frames
    Relay,
}

impl ChatProvider {
    /// Parse a provider name
    ///
    /// # Errors
    ///
    /// Returns error for an unknown name
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "relay" => Ok(Self::Relay),
            other => Err(Error::Config(format!("unknown chat provider: {other}"))),
        }
    }

    /// Extract the text fragment from one `data:` payload
    fn token(self, payload: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct RelayFrame {
            text: String,
        }

        #[derive(Deserialize)]
        struct OpenAiFrame {
            choices: Vec<OpenAiChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAiChoice {
            #[serde(default)]
            delta: OpenAiDelta,
        }

        #[derive(Default, Deserialize)]
        struct OpenAiDelta {
            content: Option<String>,
        }

        let token = match self {
            Self::Relay => serde_json::from_str::<RelayFrame>(payload)
                .ok()
                .map(|f| f.text),
            Self::OpenAi => serde_json::from_str::<OpenAiFrame>(payload)
                .ok()
                .and_then(|f| f.choices.into_iter().next())
                .and_then(|c| c.delta.content),
        };

        if token.is_none() {
            tracing::debug!(payload, "skipping unrecognised stream frame");
        }
        token.filter(|t| !t.is_empty())
    }
}

/// HTTP chat client
pub struct ChatStreamClient {
    client: reqwest::Client,
    provider: ChatProvider,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatStreamClient {
    /// Create a client for the `OpenAI` chat completions API
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for chat".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            provider: ChatProvider::OpenAi,
            endpoint: OPENAI_CHAT_URL.to_string(),
            api_key: Some(api_key),
            model,
        })
    }

    /// Create a client for a relay endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is empty
    pub fn new_relay(endpoint: String, api_key: Option<String>) -> Result<Self> {
        if endpoint.is_empty() {
            return Err(Error::Config("chat relay endpoint required".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            provider: ChatProvider::Relay,
            endpoint,
            api_key,
            model: String::new(),
        })
    }

    /// Use a different endpoint (e.g. an `OpenAI`-compatible proxy)
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        match self.provider {
            ChatProvider::OpenAi => {
                let mut messages = Vec::with_capacity(request.history.len() + 2);
                messages.push(serde_json::json!({
                    "role": "system",
                    "content": request.system_prompt,
                }));
                messages.extend(
                    request
                        .history
                        .iter()
                        .filter_map(|m| serde_json::to_value(m).ok()),
                );
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": request.prompt,
                }));

                serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                    "stream": true,
                })
            }
            ChatProvider::Relay => serde_json::json!({
                "prompt": request.prompt,
                "system_prompt": request.system_prompt,
                "conversation_history": request.history,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
            }),
        }
    }
}

#[async_trait]
impl ChatBackend for ChatStreamClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream> {
        tracing::debug!(
            provider = ?self.provider,
            history = request.history.len(),
            prompt_chars = request.prompt.chars().count(),
            "starting chat stream"
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&self.body(request));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, "chat request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Chat(format!("chat API error {status}: {body}")));
        }

        Ok(decode_token_stream(response.bytes_stream(), self.provider))
    }
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

/// Turn a raw SSE byte stream into a token stream
///
/// Ends at `[DONE]`, at end of input, or after yielding one transport error.
pub fn decode_token_stream<S, B, E>(bytes: S, provider: ChatProvider) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(token) = st.pending.pop_front() {
                return Some((Ok(token), st));
            }
            if st.finished {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    for event in st.decoder.push(chunk.as_ref()) {
                        match event {
                            SseEvent::Data(payload) => {
                                st.pending.extend(provider.token(&payload));
                            }
                            SseEvent::Done => {
                                st.finished = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "chat stream interrupted");
                    st.finished = true;
                    return Some((Err(Error::Chat(format!("stream interrupted: {e}"))), st));
                }
                None => {
                    match st.decoder.finish() {
                        Some(SseEvent::Data(payload)) => {
                            st.pending.extend(provider.token(&payload));
                            tracing::warn!("chat stream ended without end marker");
                        }
                        Some(SseEvent::Done) => {}
                        None => tracing::warn!("chat stream ended without end marker"),
                    }
                    st.finished = true;
                }
            }
        }
    }))
}
