//! Voice component integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use murmur::Error;
use murmur::pipeline::{PipelineHandle, SegmenterConfig, Stage, TextSegmenter};
use murmur::voice::{
    AudioDecoder, Mp3Decoder, PLAYBACK_SAMPLE_RATE, PlayableAudio, PlaybackClock, PlaybackConfig,
    PlaybackScheduler, SAMPLE_RATE, SpeechDetector, Timeline, TtsProvider, calculate_energy,
    samples_to_wav, validate_text,
};
use tokio_util::sync::CancellationToken;

mod common;
use common::FakeDecoder;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

fn detector() -> SpeechDetector {
    SpeechDetector::new(0.02, 300, 800, SAMPLE_RATE)
}

#[test]
fn test_energy_of_tone_and_silence() {
    assert!(calculate_energy(&generate_silence(0.1)) < f32::EPSILON);
    assert!(calculate_energy(&generate_sine_samples(440.0, 0.1, 0.5)) > 0.3);
    assert!(calculate_energy(&[]) < f32::EPSILON);
}

#[test]
fn test_utterance_completes_after_trailing_silence() {
    let mut detector = detector();

    assert!(!detector.process(&generate_sine_samples(300.0, 0.5, 0.5)));
    assert!(detector.heard_speech());

    // not enough silence yet
    assert!(!detector.process(&generate_silence(0.5)));
    assert!(detector.process(&generate_silence(0.4)));
}

#[test]
fn test_short_noise_is_not_speech() {
    let mut detector = detector();

    assert!(!detector.process(&generate_sine_samples(300.0, 0.1, 0.5)));
    assert!(!detector.process(&generate_silence(1.0)));
    assert!(!detector.heard_speech());

    detector.reset();
    assert!(!detector.heard_speech());
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");
    assert_eq!(wav_data.len(), 44 + samples.len() * 2);
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
    assert_eq!(read_samples[0], 0);
    assert!(read_samples[3] > 32000);
    assert!(read_samples[4] < -32000);
}

#[test]
fn test_segments_reproduce_the_stream_at_any_split() {
    let reply = "Merhaba Ayşe! FUE tekniğinde greftler tek tek alınır. \
                 İyileşme yaklaşık 10 gün sürer... Başka bir sorunuz var mı?";
    let chars: Vec<char> = reply.chars().collect();

    for size in [1, 2, 3, 7, 16, chars.len()] {
        let mut segmenter = TextSegmenter::new(SegmenterConfig::default(), "r1");
        let mut segments = Vec::new();

        for piece in chars.chunks(size) {
            let token: String = piece.iter().collect();
            segments.extend(segmenter.feed(&token));
        }
        segments.extend(segmenter.flush());

        let joined: String = segments.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(joined, reply, "split size {size}");
        assert!(segments.iter().enumerate().all(|(i, s)| s.seq == i));
    }
}

#[test]
fn test_decimal_is_not_a_sentence_end() {
    let mut segmenter = TextSegmenter::new(
        SegmenterConfig {
            min_sentences: 1,
            ..SegmenterConfig::default()
        },
        "r1",
    );

    assert!(segmenter.feed("Fiyat 2.").is_empty());
    let segments = segmenter.feed("500 lira. ");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].content, "Fiyat 2.500 lira. ");
}

#[test]
fn test_validate_text_limits() {
    assert_eq!(validate_text("  Merhaba  ", 100).unwrap(), "Merhaba");
    assert!(matches!(validate_text("ok", 100), Err(Error::InvalidInput(_))));

    let long = "a".repeat(TtsProvider::OpenAI.max_chars() + 1);
    assert!(validate_text(&long, TtsProvider::OpenAI.max_chars()).is_err());
}

#[test]
fn test_mp3_decoder_rejects_garbage() {
    let err = Mp3Decoder.decode(b"definitely not an mp3", PLAYBACK_SAMPLE_RATE);
    assert!(matches!(err, Err(Error::Audio(_))));
}

#[test]
fn test_timeline_overlaps_consecutive_items() {
    let mut timeline = Timeline::new(1000, Duration::from_millis(10));

    let first = timeline.schedule(vec![0.5; 100]);
    let second = timeline.schedule(vec![0.25; 100]);
    let short = timeline.schedule(vec![0.1; 4]);
    let after = timeline.schedule(vec![0.1; 10]);

    assert_eq!(first, (0, 100));
    assert_eq!(second, (90, 190));
    assert_eq!(short, (180, 184));
    // overlap is capped at half of the previous item
    assert_eq!(after, (182, 192));

    let mut out = vec![0.0; 95];
    timeline.render(&mut out);
    assert!((out[0] - 0.5).abs() < f32::EPSILON);
    assert!((out[92] - 0.75).abs() < f32::EPSILON);
    assert_eq!(timeline.cursor(), 95);
    assert!(!timeline.is_drained());

    timeline.advance(200);
    assert!(timeline.is_drained());
}

#[test]
fn test_timeline_never_schedules_behind_the_cursor() {
    let mut timeline = Timeline::new(1000, Duration::ZERO);
    timeline.schedule(vec![0.1; 50]);
    timeline.advance(500);

    assert_eq!(timeline.schedule(vec![0.1; 50]), (500, 550));
}

fn virtual_scheduler(state: &PipelineHandle) -> PlaybackScheduler {
    PlaybackScheduler::new(
        PlaybackClock::Virtual,
        Arc::new(FakeDecoder),
        PlaybackConfig::default(),
        state.clone(),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_playback_owns_the_speaking_flag() {
    let state = PipelineHandle::new();
    let playback = virtual_scheduler(&state);

    let span = playback.enqueue(b"Merhaba".to_vec(), "Merhaba").await.unwrap();
    assert!(span.is_some());
    assert!(state.snapshot().is_assistant_speaking);
    assert_eq!(state.stage(), Stage::Speaking);

    assert!(playback.wait_until_idle(&CancellationToken::new()).await);
    assert!(!state.snapshot().is_assistant_speaking);
    assert_eq!(state.stage(), Stage::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_audio_is_skipped() {
    let state = PipelineHandle::new();
    let playback = virtual_scheduler(&state);

    assert!(playback.enqueue(Vec::new(), "bozuk").await.unwrap().is_none());
    assert!(!playback.is_playing());

    playback.schedule_pcm(PlayableAudio::new(vec![0.1; 2400], PLAYBACK_SAMPLE_RATE, "sonra"));
    let texts: Vec<_> = playback
        .schedule_log()
        .into_iter()
        .map(|span| span.text)
        .collect();
    assert_eq!(texts, vec!["sonra"]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_drops_scheduled_audio() {
    let state = PipelineHandle::new();
    let playback = virtual_scheduler(&state);

    playback.schedule_pcm(PlayableAudio::new(
        vec![0.1; PLAYBACK_SAMPLE_RATE as usize * 5],
        PLAYBACK_SAMPLE_RATE,
        "uzun",
    ));
    assert!(playback.is_playing());

    playback.stop();
    assert!(!playback.is_playing());
    assert!(!state.snapshot().is_assistant_speaking);

    // a second stop is harmless
    playback.stop();
}

#[tokio::test(start_paused = true)]
async fn test_playback_force_stops_capture() {
    let state = PipelineHandle::new();
    let playback = virtual_scheduler(&state);

    let stop = CancellationToken::new();
    state.try_begin_recording(stop.clone()).unwrap();

    playback.schedule_pcm(PlayableAudio::new(vec![0.1; 240], PLAYBACK_SAMPLE_RATE, "bip"));
    assert!(stop.is_cancelled());
}
