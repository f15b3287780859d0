//! Sentence-aware micro-batching of streamed assistant text
//!
//! Tokens accumulate in a buffer. A segment is cut when enough sentences are
//! complete, when the buffer grows past a character threshold, or when the
//! buffer has waited too long with at least one complete sentence. Segments
//! are exact substrings of the input, so concatenating them reproduces the
//! streamed text.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::voice::MIN_TEXT_CHARS;

/// Terminal punctuation, optional closers, then whitespace or end of buffer
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?…]+["'”’)\]]*(?:\s+|$)"#).expect("valid regex")
});

/// Segmenter tunables
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Complete sentences that trigger a segment
    pub min_sentences: usize,
    /// Buffered characters that force a segment
    pub char_threshold: usize,
    /// Longest wait since the last segment while a sentence is complete
    pub max_wait: Duration,
    /// Shorter segments are not worth synthesizing; never below what
    /// synthesis accepts
    pub flush_min_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_sentences: 2,
            char_threshold: 220,
            max_wait: Duration::from_millis(1000),
            flush_min_chars: MIN_TEXT_CHARS,
        }
    }
}

/// A batch of assistant text sent to synthesis as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub content: String,
    /// `"{response}:{seq}"`
    pub source_id: String,
    /// Emission order within the response, from 0
    pub seq: usize,
    /// Long enough and wordy enough to synthesize
    pub speakable: bool,
}

/// Accumulates tokens of one response into segments
pub struct TextSegmenter {
    config: SegmenterConfig,
    source: String,
    buffer: String,
    next_seq: usize,
    last_emit: Instant,
}

impl TextSegmenter {
    #[must_use]
    pub fn new(config: SegmenterConfig, source: impl Into<String>) -> Self {
        Self {
            config,
            source: source.into(),
            buffer: String::new(),
            next_seq: 0,
            last_emit: Instant::now(),
        }
    }

    /// Feed a token chunk
    pub fn feed(&mut self, chunk: &str) -> Vec<TextSegment> {
        self.feed_at(chunk, Instant::now())
    }

    /// Feed a token chunk observed at `now`
    pub fn feed_at(&mut self, chunk: &str, now: Instant) -> Vec<TextSegment> {
        self.buffer.push_str(chunk);

        let mut segments = Vec::new();
        while let Some(cut) = self.cut_point(now) {
            let rest = self.buffer.split_off(cut);
            let content = std::mem::replace(&mut self.buffer, rest);
            segments.push(self.segment(content));
            self.last_emit = now;
        }
        segments
    }

    /// Emit whatever remains at end of stream
    ///
    /// Nothing is dropped; a remainder too short to speak comes back marked
    /// not speakable.
    pub fn flush(&mut self) -> Option<TextSegment> {
        if self.buffer.is_empty() {
            return None;
        }
        let content = std::mem::take(&mut self.buffer);
        Some(self.segment(content))
    }

    /// Discard buffered text and restart numbering
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_seq = 0;
        self.last_emit = Instant::now();
    }

    /// Buffered text not yet emitted
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn segment(&mut self, content: String) -> TextSegment {
        let seq = self.next_seq;
        self.next_seq += 1;

        let trimmed = content.trim();
        let speakable = trimmed.chars().count() >= self.config.flush_min_chars
            && trimmed.chars().any(char::is_alphanumeric);

        tracing::debug!(
            seq,
            chars = content.chars().count(),
            speakable,
            "segment emitted"
        );
        TextSegment {
            source_id: format!("{}:{seq}", self.source),
            seq,
            speakable,
            content,
        }
    }

    /// Byte offset to cut the buffer at, if any trigger fires
    fn cut_point(&self, now: Instant) -> Option<usize> {
        if self.buffer.is_empty() {
            return None;
        }

        let bounds = sentence_bounds(&self.buffer);
        let last_bound = bounds.last().copied();

        if bounds.len() >= self.config.min_sentences.max(1) {
            return last_bound;
        }

        if self.buffer.chars().count() > self.config.char_threshold {
            return last_bound
                .or_else(|| last_whitespace_end(&self.buffer))
                .or(Some(self.buffer.len()));
        }

        if last_bound.is_some() && now.duration_since(self.last_emit) >= self.config.max_wait {
            return last_bound;
        }

        None
    }
}

/// End offsets of complete sentences in `text`
fn sentence_bounds(text: &str) -> Vec<usize> {
    SENTENCE_END
        .find_iter(text)
        .filter(|m| !is_possible_decimal(text, m.start(), m.end()))
        .map(|m| m.end())
        .collect()
}

/// A lone `.` right after a digit at the very end may continue as a number
fn is_possible_decimal(text: &str, start: usize, end: usize) -> bool {
    end == text.len()
        && &text[start..end] == "."
        && text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_digit())
}

/// Offset just past the last whitespace run, if it leaves text before it
fn last_whitespace_end(text: &str) -> Option<usize> {
    text.char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .filter(|&end| text[..end].trim().chars().next().is_some())
}
