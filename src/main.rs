use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aria_gateway::playback::{CpalSink, OutputClock, OutputSink};
use aria_gateway::{
    CaptureSource, Config, MicCapture, PLAYBACK_SAMPLE_RATE, SessionController, SessionState,
};

/// Aria - real-time voice conversations with an AI assistant
#[derive(Parser)]
#[command(name = "aria", version, about)]
struct Cli {
    /// Path to config file (default: ~/.config/aria/config.toml)
    #[arg(short, long, env = "ARIA_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a live voice session until Ctrl-C
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,aria_gateway=info",
        1 => "info,aria_gateway=debug",
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
    let config = match &cli.config {
        Some(path) => Config::load_from(Some(path))?,
        None => Config::load()?,
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_session(config).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Open a session and keep it until Ctrl-C or the session ends by itself.
async fn run_session(config: Config) -> anyhow::Result<()> {
    let controller = SessionController::new(config);

    tracing::info!("starting voice session");
    controller.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, stopping session");
                controller.stop();
                break;
            }
            () = tokio::time::sleep(Duration::from_millis(250)) => {
                if controller.state().is_terminal() {
                    break;
                }
            }
        }
    }

    tracing::info!(status = %controller.status(), "session finished");
    if let SessionState::Failed(_) = controller.state() {
        let message = controller
            .last_error()
            .unwrap_or_else(|| "session failed".to_string());
        anyhow::bail!(message);
    }

    Ok(())
}

/// Capture from the default microphone and report frame count plus peak.
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::channel(64);
    let mut capture = MicCapture::new(Arc::new(frames_tx));

    println!("Recording for {duration} seconds...");
    capture.start()?;

    let mut frames = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    loop {
        tokio::select! {
            frame = frames_rx.recv() => {
                if frame.is_some() {
                    frames += 1;
                } else {
                    break;
                }
            }
            () = tokio::time::sleep_until(deadline) => break,
        }
    }

    let peak = capture.peak_level();
    capture.stop();

    println!("Captured {frames} frames, peak level {peak:.3}");
    if peak < 0.01 {
        println!("Warning: input level is very low, check the microphone");
    }
    Ok(())
}

/// Play a short sine sweep through the scheduled-playback sink.
async fn test_speaker() -> anyhow::Result<()> {
    let (completions_tx, completions_rx) = std::sync::mpsc::channel();
    let sink = CpalSink::open(completions_tx)?;

    println!("Playing test tone...");
    let samples: Vec<f32> = (0..PLAYBACK_SAMPLE_RATE)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect();

    sink.schedule(0, samples, sink.now());
    let played = tokio::task::spawn_blocking(move || {
        completions_rx
            .recv_timeout(Duration::from_secs(3))
            .is_ok()
    })
    .await?;

    sink.close();
    if played {
        println!("Done");
        Ok(())
    } else {
        anyhow::bail!("test tone did not finish playing")
    }
}
