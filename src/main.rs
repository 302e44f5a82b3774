use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use live_voice::voice::{
    AudioFragment, CpalMicrophone, CpalOutput, InputDevice, PlaybackSequencer, Recorder,
    rms_energy, samples_to_wav,
};
use live_voice::{
    CapturePolicy, Config, GeminiConnector, SessionSettings, Status, VoiceController,
};

/// Live Voice - talk to a conversational AI with your microphone
#[derive(Parser)]
#[command(name = "live-voice", version, about)]
struct Cli {
    /// How microphone audio is sent (streaming or batch)
    #[arg(long, value_enum)]
    policy: Option<CapturePolicy>,

    /// Gemini model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Play audio files in order through the playback queue
    Play {
        /// Files to play (WAV, MP3, Ogg Vorbis, FLAC)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,live_voice=info",
        1 => "info,live_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
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
    let mut config = Config::load()?;
    if let Some(policy) = cli.policy {
        config.capture.policy = policy;
    }
    if let Some(model) = cli.model {
        config.remote.model = model;
    }
    config.validate()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker(&config).await,
            Command::Play { files } => play_files(&config, files).await,
        };
    }

    interactive(config).await
}

/// Toggle-driven conversation loop on the terminal
async fn interactive(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        model = %config.remote.model,
        policy = %config.capture.policy,
        "starting live voice"
    );

    let output = CpalOutput::new(config.playback.sample_rate)?;
    let sequencer = PlaybackSequencer::new(Arc::new(output));
    let input = Arc::new(CpalMicrophone::new(config.capture.sample_rate));
    let connector = Arc::new(GeminiConnector::new(
        &config.remote,
        config.capture.sample_rate,
    ));

    let (mut controller, mut events) =
        VoiceController::new(SessionSettings::from(&config), input, connector, sequencer);
    let mut status = controller.status();
    let mut transcript = controller.transcript();
    let mut shown = 0;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Enter toggles the microphone, q quits.");
    println!("{}", *status.borrow_and_update());

    loop {
        tokio::select! {
            line = lines.next_line() => match line.ok().flatten() {
                Some(line) if line.trim().eq_ignore_ascii_case("q") => break,
                Some(_) => {
                    if toggle(&mut controller, &mut lines, &mut status).await {
                        break;
                    }
                }
                None => break,
            },
            Some(event) = events.recv() => controller.handle(event).await,
            Ok(()) = status.changed() => println!("{}", *status.borrow_and_update()),
            Ok(()) = transcript.changed() => print_transcript(&mut transcript, &mut shown),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.shutdown().await;
    println!();
    Ok(())
}

/// Run one toggle; another Enter while it is starting cancels the start
///
/// Returns true if the user asked to quit meanwhile.
async fn toggle(
    controller: &mut VoiceController,
    lines: &mut Lines<BufReader<Stdin>>,
    status: &mut watch::Receiver<Status>,
) -> bool {
    let stop = controller.stop_handle();
    let mut quit = false;

    let toggling = controller.toggle();
    tokio::pin!(toggling);

    loop {
        tokio::select! {
            () = &mut toggling => break,
            line = lines.next_line(), if !quit => {
                if matches!(
                    line.ok().flatten().as_deref().map(str::trim),
                    None | Some("q" | "Q")
                ) {
                    quit = true;
                }
                stop.request();
            }
            Ok(()) = status.changed() => println!("{}", *status.borrow_and_update()),
        }
    }

    quit
}

/// Print whatever the transcript gained since last time
fn print_transcript(transcript: &mut watch::Receiver<String>, shown: &mut usize) {
    let text = transcript.borrow_and_update();

    if text.len() < *shown {
        // A new session reset it
        *shown = 0;
    }
    if text.len() > *shown {
        if *shown == 0 {
            print!("AI: ");
        }
        print!("{}", &text[*shown..]);
        let _ = std::io::stdout().flush();
        *shown = text.len();
    }
}

/// Show a level meter for the microphone
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let recorder = Recorder::new();
    let sink = recorder.sink();
    let mic = CpalMicrophone::new(config.capture.sample_rate);
    let mut capture = tokio::task::spawn_blocking(move || mic.open(sink)).await??;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Each second is measured on its own
        let samples = recorder.take();
        let energy = rms_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Play a tone through the playback queue
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let wav = samples_to_wav(&samples, sample_rate)?;
    let sequencer = PlaybackSequencer::new(Arc::new(CpalOutput::new(
        config.playback.sample_rate,
    )?));

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    sequencer.enqueue(AudioFragment::new(wav, Some("audio/wav".to_string())));
    sequencer.wait_idle().await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Queue files back to back, skipping any that fail to decode
async fn play_files(config: &Config, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let sequencer = PlaybackSequencer::new(Arc::new(CpalOutput::new(
        config.playback.sample_rate,
    )?));

    for path in files {
        let data = tokio::fs::read(&path).await?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "queueing file");
        sequencer.enqueue(AudioFragment::new(data, None));
    }

    sequencer.wait_idle().await;
    println!(
        "Played {} file(s), skipped {}",
        sequencer.played(),
        sequencer.skipped()
    );

    Ok(())
}
