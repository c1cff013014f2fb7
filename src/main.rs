use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ember_gateway::config::SegmenterConfig;
use ember_gateway::protocol::{AudioFrame, AudioParams};
use ember_gateway::segmenter::{SegmentEvent, Segmenter};
use ember_gateway::{Config, Daemon};

/// Ember - MQTT voice backend for embedded assistant devices
#[derive(Parser)]
#[command(name = "ember", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "EMBER_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Run the voice segmenter over a WAV file and print the boundaries
    SegmentWav {
        /// Path to a 16-bit mono WAV file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,ember_gateway=info",
        1 => "info,ember_gateway=debug",
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
    let config = Config::load(cli.config.as_deref())?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::CheckConfig => check_config(&config),
            Command::SegmentWav { path } => segment_wav(&config.segmenter, &path),
        };
    }

    tracing::info!(
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        "starting ember gateway"
    );

    let daemon = Daemon::new(config)?;
    daemon.run().await?;

    Ok(())
}

/// Validate the configuration and report what the daemon would use
fn check_config(config: &Config) -> anyhow::Result<()> {
    println!("broker:       {}:{}", config.mqtt.host, config.mqtt.port);
    println!("data dir:     {}", config.resolve_data_dir().display());
    println!(
        "stt backend:  {:?} ({})",
        config.providers.stt_backend, config.providers.stt_model
    );
    println!("chat model:   {}", config.providers.chat_model);
    println!("tts model:    {}", config.providers.tts_model);
    match (&config.ota.firmware_path, &config.ota.firmware_version) {
        (Some(path), Some(version)) => {
            println!("firmware:     {version} ({})", path.display());
        }
        _ => println!("firmware:     not configured"),
    }
    if config.device_secret.is_none() {
        println!("warning:      no device secret set, any token will be accepted");
    }
    println!("configuration ok");
    Ok(())
}

/// Offline segmenter check: feed a WAV file as if a device had streamed it
fn segment_wav(config: &SegmenterConfig, path: &Path) -> anyhow::Result<()> {
    let (samples, sample_rate) = ember_gateway::audio::wav_to_pcm(path)?;
    let params = AudioParams {
        sample_rate,
        ..AudioParams::default()
    };
    let frame_len = params.samples_per_frame();
    println!(
        "{}: {} samples at {sample_rate} Hz, {} ms frames",
        path.display(),
        samples.len(),
        params.frame_ms
    );

    let mut segmenter = Segmenter::new(config, params);
    let mut utterances = 0u32;
    for (seq, chunk) in samples.chunks(frame_len).enumerate() {
        let seq = u32::try_from(seq)?;
        let frame = AudioFrame {
            seq,
            captured_at_ms: u64::from(seq) * u64::from(params.frame_ms),
            pcm: chunk.to_vec(),
        };
        match segmenter.push(frame) {
            Some(SegmentEvent::Started) => {
                let at_ms = u64::from(seq) * u64::from(params.frame_ms);
                println!("utterance opened at {at_ms} ms");
            }
            Some(SegmentEvent::Closed(utterance)) => {
                utterances += 1;
                println!(
                    "utterance {utterances} closed ({:?}, {} frames)",
                    utterance.reason,
                    utterance.frames.len()
                );
            }
            None => {}
        }
    }
    if let Some(SegmentEvent::Closed(utterance)) = segmenter.force_close() {
        utterances += 1;
        println!(
            "utterance {utterances} closed at end of file ({} frames)",
            utterance.frames.len()
        );
    }
    println!("{utterances} utterance(s) total");
    Ok(())
}
