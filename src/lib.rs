//! Murmur - realtime voice assistant pipeline
//!
//! This library provides the building blocks of a spoken conversation:
//! - Microphone capture with end-of-utterance detection
//! - Provider speech-to-text and text-to-speech
//! - Streamed chat replies cut into speakable segments
//! - Ordered, gapless playback with self-echo suppression
//! - Persistent per-user conversation history
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Capture  │──▶│ Transcribe │──▶│ Chat stream │──▶│ Segmenter │
//! └──────────┘   └────────────┘   └─────────────┘   └─────┬─────┘
//!      ▲                                                  │
//!      │ force stop         ┌──────────┐   ┌───────────┐  │
//!      └────────────────────│ Playback │◀──│ Synthesis │◀─┘
//!                           └──────────┘   └───────────┘
//! ```

pub mod api;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod persona;
pub mod pipeline;
pub mod prompt;
pub mod session;
pub mod voice;

pub use config::Config;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use persona::Persona;
pub use pipeline::{Orchestrator, OrchestratorBuilder, PipelineHandle};
pub use session::Session;
