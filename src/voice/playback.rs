//! Gapless audio playback to speakers
//!
//! Decoded items are laid out on a sample timeline. Each item starts where
//! the previous one ends minus a small overlap, and the output callback mixes
//! whatever is under the play cursor. A virtual clock drives the same
//! timeline from tokio time when no output device is wanted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::decode::AudioDecoder;
use crate::pipeline::PipelineHandle;
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

const IDLE_POLL: Duration = Duration::from_millis(20);
const SCHEDULE_LOG_CAP: usize = 64;

/// Playback tunables
#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    /// How much each item overlaps the end of the previous one
    pub overlap: Duration,
    /// Quiet time after draining before playback counts as finished
    pub idle_grace: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            overlap: Duration::from_millis(55),
            idle_grace: Duration::from_millis(200),
        }
    }
}

/// Decoded audio of one segment
#[derive(Debug, Clone)]
pub struct PlayableAudio {
    pub samples: Vec<f32>,
    pub duration_secs: f32,
    pub segment_text: String,
}

impl PlayableAudio {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(samples: Vec<f32>, sample_rate: u32, segment_text: impl Into<String>) -> Self {
        let duration_secs = samples.len() as f32 / sample_rate as f32;
        Self {
            samples,
            duration_secs,
            segment_text: segment_text.into(),
        }
    }
}

/// Where an item landed on the timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSpan {
    pub start_frame: u64,
    pub end_frame: u64,
    pub text: String,
}

struct TimelineItem {
    start: u64,
    samples: Vec<f32>,
}

impl TimelineItem {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Mono sample timeline with a play cursor
pub struct Timeline {
    overlap_frames: u64,
    cursor: u64,
    items: VecDeque<TimelineItem>,
    last: Option<(u64, u64)>,
}

impl Timeline {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(sample_rate: u32, overlap: Duration) -> Self {
        Self {
            overlap_frames: (overlap.as_secs_f64() * f64::from(sample_rate)) as u64,
            cursor: 0,
            items: VecDeque::new(),
            last: None,
        }
    }

    /// Place samples after the previously scheduled item
    ///
    /// The overlap never exceeds half of the previous item, so start order
    /// always follows schedule order.
    pub fn schedule(&mut self, samples: Vec<f32>) -> (u64, u64) {
        let start = self.last.map_or(self.cursor, |(prev_start, prev_end)| {
            let overlap = self.overlap_frames.min((prev_end - prev_start) / 2);
            (prev_end - overlap).max(self.cursor)
        });
        let end = start + samples.len() as u64;

        self.last = Some((start, end));
        self.items.push_back(TimelineItem { start, samples });
        (start, end)
    }

    /// Mix the frames under the cursor into `out` and advance
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let from = self.cursor;
        let to = from + out.len() as u64;

        for item in &self.items {
            let start = item.start.max(from);
            let end = item.end().min(to);
            for frame in start..end {
                out[(frame - from) as usize] += item.samples[(frame - item.start) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.advance(out.len() as u64);
    }

    /// Move the cursor without producing output
    pub fn advance(&mut self, frames: u64) {
        self.cursor += frames;
        let cursor = self.cursor;
        self.items.retain(|item| item.end() > cursor);
    }

    /// Nothing left to play
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything scheduled
    pub fn clear(&mut self) {
        self.items.clear();
        self.last = None;
    }

    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// What moves the play cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackClock {
    /// The default cpal output device
    Device,
    /// Tokio time, without audio output
    Virtual,
}

struct Shared {
    timeline: Timeline,
    playing: bool,
    log: VecDeque<ScheduledSpan>,
}

struct VirtualClock {
    origin: Instant,
    advanced: u64,
}

enum Clock {
    Device(OutputThread),
    Virtual(Mutex<VirtualClock>),
}

struct Inner {
    shared: Arc<Mutex<Shared>>,
    decoder: Arc<dyn AudioDecoder>,
    state: PipelineHandle,
    config: PlaybackConfig,
    clock: Clock,
}

/// Schedules decoded audio for ordered, gapless playback
///
/// Owns the "assistant is speaking" flag for the whole playing span.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<Inner>,
}

impl PlaybackScheduler {
    /// Create a scheduler
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the output device cannot be opened
    pub fn new(
        clock: PlaybackClock,
        decoder: Arc<dyn AudioDecoder>,
        config: PlaybackConfig,
        state: PipelineHandle,
    ) -> Result<Self> {
        let shared = Arc::new(Mutex::new(Shared {
            timeline: Timeline::new(PLAYBACK_SAMPLE_RATE, config.overlap),
            playing: false,
            log: VecDeque::new(),
        }));

        let clock = match clock {
            PlaybackClock::Device => Clock::Device(OutputThread::open(Arc::clone(&shared))?),
            PlaybackClock::Virtual => Clock::Virtual(Mutex::new(VirtualClock {
                origin: Instant::now(),
                advanced: 0,
            })),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                decoder,
                state,
                config,
                clock,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.inner.shared)
    }

    /// Bring a virtual cursor up to the current time
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn sync(&self) {
        if let Clock::Virtual(clock) = &self.inner.clock {
            let mut clock = clock.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = clock.origin.elapsed().as_secs_f64();
            let target = (elapsed * f64::from(PLAYBACK_SAMPLE_RATE)) as u64;
            let frames = target.saturating_sub(clock.advanced);
            clock.advanced = target.max(clock.advanced);
            drop(clock);

            if frames > 0 {
                self.lock().timeline.advance(frames);
            }
        }
    }

    /// Decode and schedule one payload
    ///
    /// An undecodable payload is logged and skipped; it never stalls the
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns error only if the decode task itself dies
    pub async fn enqueue(&self, audio: Vec<u8>, text: &str) -> Result<Option<ScheduledSpan>> {
        self.enqueue_while(audio, text, || true).await
    }

    /// Decode and schedule one payload while `keep` holds
    ///
    /// `keep` is checked again after the decode, under the timeline lock, so
    /// audio that went stale while decoding never reaches the timeline.
    /// Returns `None` for skipped or dropped payloads.
    ///
    /// # Errors
    ///
    /// Returns error only if the decode task itself dies
    pub async fn enqueue_while<F>(
        &self,
        audio: Vec<u8>,
        text: &str,
        keep: F,
    ) -> Result<Option<ScheduledSpan>>
    where
        F: Fn() -> bool,
    {
        let decoder = Arc::clone(&self.inner.decoder);
        let decoded =
            tokio::task::spawn_blocking(move || decoder.decode(&audio, PLAYBACK_SAMPLE_RATE))
                .await
                .map_err(|e| Error::Audio(format!("decode task failed: {e}")))?;

        let samples = match decoded {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(error = %e, text, "skipping undecodable audio");
                return Ok(None);
            }
        };

        self.sync();
        let shared = self.lock();
        if !keep() {
            drop(shared);
            tracing::debug!(text, "dropping audio that went stale while decoding");
            return Ok(None);
        }
        Ok(Some(self.place(
            shared,
            PlayableAudio::new(samples, PLAYBACK_SAMPLE_RATE, text),
        )))
    }

    /// Schedule already-decoded audio
    pub fn schedule_pcm(&self, audio: PlayableAudio) -> ScheduledSpan {
        self.sync();
        let shared = self.lock();
        self.place(shared, audio)
    }

    fn place(&self, mut shared: MutexGuard<'_, Shared>, audio: PlayableAudio) -> ScheduledSpan {
        let (start_frame, end_frame) = shared.timeline.schedule(audio.samples);
        let span = ScheduledSpan {
            start_frame,
            end_frame,
            text: audio.segment_text,
        };
        if shared.log.len() == SCHEDULE_LOG_CAP {
            shared.log.pop_front();
        }
        shared.log.push_back(span.clone());
        let entering = !shared.playing;
        shared.playing = true;
        drop(shared);

        if entering {
            self.inner.state.force_stop_capture();
            self.inner.state.set_speaking(true);
            tracing::info!("playback started");
        }
        tracing::debug!(
            start = span.start_frame,
            end = span.end_frame,
            secs = audio.duration_secs,
            "audio scheduled"
        );
        span
    }

    /// Wait until everything scheduled has played and the grace period
    /// passed quietly, then leave the playing state
    ///
    /// Returns false if `cancel` fired first.
    pub async fn wait_until_idle(&self, cancel: &CancellationToken) -> bool {
        loop {
            self.sync();
            let drained = self.lock().timeline.is_drained();

            let pause = if drained {
                self.inner.config.idle_grace
            } else {
                IDLE_POLL
            };
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = cancel.cancelled() => return false,
            }

            if !drained {
                continue;
            }

            self.sync();
            let mut shared = self.lock();
            if !shared.timeline.is_drained() {
                continue;
            }
            let was_playing = std::mem::replace(&mut shared.playing, false);
            drop(shared);

            if was_playing {
                self.inner.state.set_speaking(false);
                tracing::info!("playback finished");
            }
            return true;
        }
    }

    /// Drop all scheduled audio and leave the playing state
    pub fn stop(&self) {
        let mut shared = self.lock();
        shared.timeline.clear();
        let was_playing = std::mem::replace(&mut shared.playing, false);
        drop(shared);

        if was_playing {
            self.inner.state.set_speaking(false);
            tracing::info!("playback stopped");
        }
    }

    /// Whether the playing state is active
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.sync();
        self.lock().playing
    }

    /// Recently scheduled spans, oldest first
    #[must_use]
    pub fn schedule_log(&self) -> Vec<ScheduledSpan> {
        self.lock().log.iter().cloned().collect()
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// cpal output stream kept alive on its own thread
struct OutputThread {
    stop: Option<std::sync::mpsc::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl OutputThread {
    fn open(shared: Arc<Mutex<Shared>>) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("murmur-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio playback closed");
            })
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::DeviceUnavailable(
                    "playback thread exited".to_string(),
                ))
            }
        }
    }
}

impl Drop for OutputThread {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn build_output_stream(shared: Arc<Mutex<Shared>>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels,
        "audio playback initialized"
    );

    let mut mono = Vec::new();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                lock_shared(&shared).timeline.render(&mut mono);

                for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = PLAYBACK_SAMPLE_RATE;

    struct Passthrough;

    impl AudioDecoder for Passthrough {
        fn decode(&self, bytes: &[u8], _target_rate: u32) -> Result<Vec<f32>> {
            if bytes.is_empty() {
                return Err(Error::Audio("empty".into()));
            }
            Ok(vec![0.1; usize::from(bytes[0]) * 240])
        }
    }

    fn scheduler(state: &PipelineHandle) -> PlaybackScheduler {
        PlaybackScheduler::new(
            PlaybackClock::Virtual,
            Arc::new(Passthrough),
            PlaybackConfig::default(),
            state.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_items_overlap_previous_end() {
        let mut timeline = Timeline::new(RATE, Duration::from_millis(55));

        let (a_start, a_end) = timeline.schedule(vec![0.1; 24000]);
        let (b_start, b_end) = timeline.schedule(vec![0.1; 12000]);

        assert_eq!(a_start, 0);
        assert_eq!(a_end, 24000);
        assert_eq!(b_start, 24000 - 1320);
        assert_eq!(b_end, b_start + 12000);
    }

    #[test]
    fn test_overlap_capped_for_short_items() {
        let mut timeline = Timeline::new(RATE, Duration::from_millis(55));

        let (a_start, a_end) = timeline.schedule(vec![0.1; 100]);
        let (b_start, _) = timeline.schedule(vec![0.1; 100]);
        assert!(b_start > a_start);
        assert_eq!(b_start, a_end - 50);
    }

    #[test]
    fn test_late_item_starts_at_cursor() {
        let mut timeline = Timeline::new(RATE, Duration::from_millis(55));
        timeline.schedule(vec![0.1; 1000]);

        timeline.advance(5000);
        assert!(timeline.is_drained());

        let (start, _) = timeline.schedule(vec![0.1; 1000]);
        assert_eq!(start, 5000);
    }

    #[test]
    fn test_render_mixes_and_drains() {
        let mut timeline = Timeline::new(RATE, Duration::ZERO);
        timeline.schedule(vec![0.25; 4]);
        timeline.schedule(vec![-0.5; 2]);

        let mut out = [0.0f32; 8];
        timeline.render(&mut out);
        assert_eq!(out, [0.25, 0.25, 0.25, 0.25, -0.5, -0.5, 0.0, 0.0]);
        assert!(timeline.is_drained());
        assert_eq!(timeline.cursor(), 8);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut timeline = Timeline::new(RATE, Duration::ZERO);
        timeline.schedule(vec![0.25; 100]);
        timeline.clear();
        assert!(timeline.is_drained());

        let (start, _) = timeline.schedule(vec![0.25; 10]);
        assert_eq!(start, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_spans_whole_playback() {
        let state = PipelineHandle::new();
        let playback = scheduler(&state);

        // 100ms each
        playback.enqueue(vec![10], "one").await.unwrap().unwrap();
        assert!(state.snapshot().is_assistant_speaking);
        playback.enqueue(vec![10], "two").await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        assert!(playback.wait_until_idle(&cancel).await);
        assert!(!state.snapshot().is_assistant_speaking);
        assert!(!playback.is_playing());

        let texts: Vec<_> = playback.schedule_log().into_iter().map(|s| s.text).collect();
        assert_eq!(texts, ["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_skips_item() {
        let state = PipelineHandle::new();
        let playback = scheduler(&state);

        assert!(playback.enqueue(Vec::new(), "bad").await.unwrap().is_none());
        assert!(playback.enqueue(vec![1], "good").await.unwrap().is_some());
        assert_eq!(playback.schedule_log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_checked_after_decode() {
        let state = PipelineHandle::new();
        let playback = scheduler(&state);

        assert!(playback
            .enqueue_while(vec![10], "stale", || false)
            .await
            .unwrap()
            .is_none());
        assert!(!playback.is_playing());
        assert!(!state.snapshot().is_assistant_speaking);
        assert!(playback.schedule_log().is_empty());

        let span = playback.enqueue_while(vec![10], "fresh", || true).await.unwrap();
        assert_eq!(span.unwrap().text, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_start_force_stops_capture() {
        let state = PipelineHandle::new();
        let playback = scheduler(&state);
        let stop = CancellationToken::new();
        state.try_begin_recording(stop.clone()).unwrap();

        playback.schedule_pcm(PlayableAudio::new(vec![0.1; 2400], RATE, "hi"));
        assert!(stop.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_speaking() {
        let state = PipelineHandle::new();
        let playback = scheduler(&state);

        playback.schedule_pcm(PlayableAudio::new(vec![0.1; 240_000], RATE, "long"));
        assert!(playback.is_playing());

        playback.stop();
        assert!(!playback.is_playing());
        assert!(!state.snapshot().is_assistant_speaking);

        // Nothing left to wait for
        assert!(playback.wait_until_idle(&CancellationToken::new()).await);
    }
}
