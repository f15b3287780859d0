//! Audio capture from microphone

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::vad::SpeechDetector;
use crate::pipeline::{PipelineHandle, Stage};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// MIME type of captured chunks
pub const WAV_MIME: &str = "audio/wav";

/// One captured piece of audio, consumed once by transcription
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
}

/// Capture tunables
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Hard cap on one capture
    pub max_duration: Duration,
    /// Cut a chunk every interval instead of once per utterance
    pub chunk_interval: Option<Duration>,
    pub energy_threshold: f32,
    pub end_silence_ms: u64,
    pub min_speech_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(10),
            chunk_interval: None,
            energy_threshold: 0.02,
            end_silence_ms: 800,
            min_speech_ms: 300,
        }
    }
}

/// Releases an opened device when dropped
pub struct DeviceGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A microphone-like source of mono f32 samples
pub trait InputDevice: Send + Sync {
    /// Start delivering sample blocks into `sink` until the guard drops
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device is missing or access is denied
    fn open(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<DeviceGuard>;

    /// Sample rate of delivered blocks
    fn sample_rate(&self) -> u32;
}

/// The default cpal input device
///
/// cpal streams are not `Send`, so each open runs the stream on its own
/// thread until the guard is released.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl InputDevice for CpalMicrophone {
    fn open(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<DeviceGuard> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("murmur-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blocks until the guard drops the sender
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::DeviceUnavailable(
                    "capture thread exited".to_string(),
                ));
            }
        }

        Ok(DeviceGuard::new(move || {
            drop(stop_tx);
            if handle.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }))
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

fn build_input_stream(sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable audio config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = sink.send(data.to_vec());
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    Ok(stream)
}

/// Starts and stops microphone captures for one session
pub struct AudioCapture {
    device: Arc<dyn InputDevice>,
    config: CaptureConfig,
    state: PipelineHandle,
}

impl AudioCapture {
    #[must_use]
    pub fn new(device: Arc<dyn InputDevice>, config: CaptureConfig, state: PipelineHandle) -> Self {
        Self {
            device,
            config,
            state,
        }
    }

    /// Claim the microphone and start a capture
    ///
    /// # Errors
    ///
    /// Returns `Busy` while recording, processing or speaking, and
    /// `DeviceUnavailable` if the device cannot be opened
    pub fn start_capture(&self) -> Result<CaptureStream> {
        let stop = CancellationToken::new();
        self.state.try_begin_recording(stop.clone())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let guard = match self.device.open(tx) {
            Ok(guard) => guard,
            Err(e) => {
                self.state.end_recording(Stage::Idle);
                return Err(match e {
                    Error::DeviceUnavailable(_) => e,
                    other => Error::DeviceUnavailable(other.to_string()),
                });
            }
        };

        let sample_rate = self.device.sample_rate();
        let now = Instant::now();
        tracing::info!(sample_rate, "capture started");

        Ok(CaptureStream {
            rx,
            guard: Some(guard),
            state: self.state.clone(),
            stop,
            detector: SpeechDetector::new(
                self.config.energy_threshold,
                self.config.min_speech_ms,
                self.config.end_silence_ms,
                sample_rate,
            ),
            sample_rate,
            deadline: now + self.config.max_duration,
            chunk_interval: self.config.chunk_interval,
            chunk_started: now,
            chunk_captured_at: Utc::now(),
            buffer: Vec::new(),
            finished: false,
        })
    }

    /// Stop the active capture; a no-op when none is active
    pub fn stop_capture(&self) -> bool {
        self.state.stop_recording()
    }
}

/// A running capture yielding audio chunks until it ends
///
/// Dropping the stream releases the device on every path.
pub struct CaptureStream {
    rx: mpsc::UnboundedReceiver<Vec<f32>>,
    guard: Option<DeviceGuard>,
    state: PipelineHandle,
    stop: CancellationToken,
    detector: SpeechDetector,
    sample_rate: u32,
    deadline: Instant,
    chunk_interval: Option<Duration>,
    chunk_started: Instant,
    chunk_captured_at: DateTime<Utc>,
    buffer: Vec<f32>,
    finished: bool,
}

impl CaptureStream {
    /// Next chunk, or `None` once the capture has ended
    ///
    /// Ends on stop, the duration cap, trailing silence after speech, or
    /// the device closing. A capture without speech yields no chunk.
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub async fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let wake = self
                .chunk_interval
                .map_or(self.deadline, |interval| {
                    (self.chunk_started + interval).min(self.deadline)
                });

            tokio::select! {
                () = self.stop.cancelled() => {
                    tracing::debug!("capture stopped");
                    return self.finish();
                }
                () = tokio::time::sleep_until(wake) => {
                    if Instant::now() >= self.deadline {
                        tracing::info!("capture reached max duration");
                        return self.finish();
                    }
                    self.chunk_started = Instant::now();
                    if let Some(chunk) = self.cut()? {
                        return Ok(Some(chunk));
                    }
                }
                samples = self.rx.recv() => match samples {
                    Some(samples) => {
                        let complete = self.detector.process(&samples);
                        self.buffer.extend_from_slice(&samples);
                        if complete {
                            return self.finish();
                        }
                    }
                    None => {
                        tracing::warn!("input device closed");
                        return self.finish();
                    }
                },
            }
        }
    }

    /// Whether the capture has ended
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn cut(&mut self) -> Result<Option<AudioChunk>> {
        if !self.detector.heard_speech() || self.buffer.is_empty() {
            return Ok(None);
        }

        let samples = std::mem::take(&mut self.buffer);
        let captured_at = std::mem::replace(&mut self.chunk_captured_at, Utc::now());
        let bytes = samples_to_wav(&samples, self.sample_rate)?;

        tracing::debug!(samples = samples.len(), bytes = bytes.len(), "audio chunk cut");
        Ok(Some(AudioChunk {
            bytes,
            mime_type: WAV_MIME.to_string(),
            captured_at,
        }))
    }

    fn finish(&mut self) -> Result<Option<AudioChunk>> {
        self.finished = true;

        if !self.detector.heard_speech() {
            self.release(Stage::Idle);
            tracing::info!("no speech detected");
            return Ok(None);
        }
        self.release(Stage::Transcribing);
        self.cut()
    }

    fn release(&mut self, then: Stage) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            self.state.end_recording(then);
            tracing::debug!("capture device released");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.release(Stage::Idle);
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct ScriptedDevice {
        blocks: Vec<Vec<f32>>,
        released: Arc<AtomicUsize>,
        deny: bool,
    }

    impl InputDevice for ScriptedDevice {
        fn open(&self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<DeviceGuard> {
            if self.deny {
                return Err(Error::DeviceUnavailable("permission denied".into()));
            }
            for block in &self.blocks {
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

    fn device(blocks: Vec<Vec<f32>>) -> (Arc<ScriptedDevice>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let device = Arc::new(ScriptedDevice {
            blocks,
            released: Arc::clone(&released),
            deny: false,
        });
        (device, released)
    }

    fn speech_then_silence() -> Vec<Vec<f32>> {
        vec![vec![0.3; 8000], vec![0.0; 16000]]
    }

    #[test]
    fn test_wav_header() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte header + 3 samples * 2 bytes
        assert_eq!(wav.len(), 50);
    }

    #[tokio::test]
    async fn test_utterance_yields_one_chunk_and_releases() {
        let state = PipelineHandle::new();
        let (device, released) = device(speech_then_silence());
        let capture = AudioCapture::new(device, CaptureConfig::default(), state.clone());

        let mut stream = capture.start_capture().unwrap();
        assert!(state.snapshot().is_recording);

        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.mime_type, WAV_MIME);
        assert!(stream.is_finished());
        assert!(stream.next_chunk().await.unwrap().is_none());

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!state.snapshot().is_recording);

        drop(stream);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_device_is_unavailable() {
        let state = PipelineHandle::new();
        let device = Arc::new(ScriptedDevice {
            blocks: Vec::new(),
            released: Arc::new(AtomicUsize::new(0)),
            deny: true,
        });
        let capture = AudioCapture::new(device, CaptureConfig::default(), state.clone());

        let err = capture.start_capture().err().unwrap();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        assert!(!state.snapshot().is_recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_cap_ends_silent_capture() {
        let state = PipelineHandle::new();
        let (device, released) = device(vec![vec![0.0; 1600]]);
        let capture = AudioCapture::new(device, CaptureConfig::default(), state);

        let mut stream = capture.start_capture().unwrap();
        let started = Instant::now();
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_capture_is_idempotent() {
        let state = PipelineHandle::new();
        let (device, _released) = device(Vec::new());
        let capture = AudioCapture::new(device, CaptureConfig::default(), state);

        assert!(!capture.stop_capture());

        let mut stream = capture.start_capture().unwrap();
        assert!(capture.stop_capture());
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(!capture.stop_capture());
    }
}
