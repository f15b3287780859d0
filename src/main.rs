use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use murmur::config::{Config, LoadOptions};
use murmur::db::ConversationStore;
use murmur::pipeline::PipelineHandle;
use murmur::session::Session;
use murmur::voice::{
    CpalMicrophone, InputDevice, Mp3Decoder, PLAYBACK_SAMPLE_RATE, PlayableAudio, PlaybackClock,
    PlaybackConfig, PlaybackScheduler, calculate_energy,
};

/// Murmur - realtime voice assistant
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/murmur/config.toml)
    #[arg(short, long, env = "MURMUR_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not start the HTTP surface alongside a talk session
    #[arg(long, env = "MURMUR_NO_SERVER")]
    no_server: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive voice session (default)
    Talk,
    /// Serve the HTTP surface only
    Serve,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Merhaba! Bu bir ses testidir.")]
        text: String,
    },
    /// Print the current conversation of the configured user
    History,
    /// Delete all conversations of the configured user
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,murmur=info",
        1 => "info,murmur=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = LoadOptions {
        config_path: cli.config,
        disable_server: cli.no_server,
    };

    match cli.command.unwrap_or(Command::Talk) {
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&options, &text).await,
        Command::History => history(&options),
        Command::Clear => clear(&options),
        Command::Serve => {
            let session = Session::new(Config::load_with_options(&options)?)?;
            tracing::info!(port = session.config().api_server.port, "starting murmur server");
            session.serve().await?;
            Ok(())
        }
        Command::Talk => {
            let config = Config::load_with_options(&options)?;
            tracing::info!(
                persona = %config.persona.id,
                user = %config.identity.id,
                stt = ?config.stt.provider,
                tts = ?config.tts.provider,
                "starting murmur"
            );
            Session::new(config)?.talk().await?;
            Ok(())
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = CpalMicrophone;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let guard = microphone.open(tx)?;

    println!("Sample rate: {} Hz", microphone.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Ok(block) = rx.try_recv() {
            samples.extend(block);
        }
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    drop(guard);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

fn speaker() -> anyhow::Result<PlaybackScheduler> {
    Ok(PlaybackScheduler::new(
        PlaybackClock::Device,
        Arc::new(Mp3Decoder),
        PlaybackConfig::default(),
        PipelineHandle::new(),
    )?)
}

/// Test speaker output with a sine wave
#[allow(clippy::cast_precision_loss)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = speaker()?;

    let frequency = 440.0_f32;
    let num_samples = usize::try_from(PLAYBACK_SAMPLE_RATE)? * 2;

    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), PLAYBACK_SAMPLE_RATE);

    playback.schedule_pcm(PlayableAudio::new(samples, PLAYBACK_SAMPLE_RATE, "tone"));
    playback.wait_until_idle(&CancellationToken::new()).await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output with the configured provider and preset
async fn test_tts(options: &LoadOptions, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load_with_options(options)?;
    let session = Session::new(config)?;
    let synthesizer = session.synthesizer()?;
    let preset = session.config().persona.preset(&session.config().tts.preset);

    println!("Synthesizing speech...");
    let audio = synthesizer.synthesize(text, &preset.voice_settings).await?;
    println!("Got {} bytes of audio data", audio.len());

    println!("Playing audio...");
    let playback = speaker()?;
    if playback.enqueue(audio, text).await?.is_none() {
        anyhow::bail!("audio could not be decoded");
    }
    playback.wait_until_idle(&CancellationToken::new()).await;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Print the configured user's current conversation
fn history(options: &LoadOptions) -> anyhow::Result<()> {
    let session = Session::new(Config::load_with_options(options)?)?;
    let user = &session.config().identity;
    let conversation = session.conversations().fetch_current(&user.id)?;

    println!("Conversation {} ({} messages)", conversation.id, conversation.turns.len());
    for turn in &conversation.turns {
        println!(
            "[{}] {}: {}",
            turn.created_at.format("%Y-%m-%d %H:%M"),
            turn.role.as_str(),
            turn.text
        );
    }
    Ok(())
}

/// Delete every conversation of the configured user
fn clear(options: &LoadOptions) -> anyhow::Result<()> {
    let session = Session::new(Config::load_with_options(options)?)?;
    let user = &session.config().identity;
    session.conversations().clear(&user.id, None)?;
    println!("Cleared conversation history for user {}", user.id);
    Ok(())
}
