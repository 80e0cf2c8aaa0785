use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use live_consult::{
    ConsultConfig, GeminiLiveChannel, OUTPUT_SAMPLE_RATE, Session, tool_declarations,
    core::tools::ConsultationRecord,
    devices::FileBackend,
    session::{FinalPayloadCallback, TranscriptCallback, TranscriptUpdate},
};

/// Live Consult - duplex voice consultation with evidence capture
#[derive(Parser, Debug)]
#[command(name = "live-consult")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one consultation against file-backed devices
    Run {
        /// 16-bit WAV file replayed as the microphone
        #[arg(long, value_name = "WAV")]
        mic: PathBuf,

        /// Image file served as the camera frame
        #[arg(long, value_name = "IMAGE")]
        camera: PathBuf,

        /// WAV file the agent's speech is written to
        #[arg(long, value_name = "WAV", default_value = "agent.wav")]
        speaker: PathBuf,

        /// Where to write the final consultation record (prints to stdout if not specified)
        #[arg(short = 'o', long = "record", value_name = "FILE")]
        record: Option<PathBuf>,
    },

    /// Print the tool declarations sent to the agent
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    // Must be installed before the first TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Tools => {
            let declarations = serde_json::to_string_pretty(&tool_declarations())?;
            println!("{declarations}");
            Ok(())
        }
        Commands::Run {
            mic,
            camera,
            speaker,
            record,
        } => {
            let config = match &cli.config {
                Some(path) => {
                    info!("Loading configuration from {}", path.display());
                    ConsultConfig::from_file(path)?
                }
                None => ConsultConfig::from_env()?,
            };
            run(config, mic, camera, speaker, record).await
        }
    }
}

async fn run(
    config: ConsultConfig,
    mic: PathBuf,
    camera: PathBuf,
    speaker: PathBuf,
    record: Option<PathBuf>,
) -> anyhow::Result<()> {
    let channel = GeminiLiveChannel::new(config.gemini_config()?)
        .context("Failed to configure the Gemini Live channel")?;
    let backend = FileBackend {
        microphone: mic,
        camera,
        speaker,
        speaker_rate: OUTPUT_SAMPLE_RATE,
    };

    let session = Session::new(
        config.session_config(),
        Arc::new(backend),
        Arc::new(channel),
    );
    info!(session_id = %session.id(), "Session created");

    let on_transcript: TranscriptCallback = Arc::new(|update: TranscriptUpdate| {
        Box::pin(async move {
            if update.is_final {
                info!(speaker = %update.speaker, "{}", update.text);
            }
        })
    });
    session.on_transcript(on_transcript);

    let on_final: FinalPayloadCallback = Arc::new(move |record_value: ConsultationRecord| {
        let target = record.clone();
        Box::pin(async move {
            if let Err(e) = write_record(&record_value, target).await {
                error!("Failed to write consultation record: {e:#}");
            }
        })
    });
    session.on_final_payload(on_final);

    session.start().await?;

    let status = tokio::select! {
        status = session.wait_closed() => status,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, ending session");
            session.end().await;
            session.status()
        }
    };

    match status.error {
        Some(e) => Err(anyhow!(e).context(status.message)),
        None => {
            info!("{}", status.message);
            Ok(())
        }
    }
}

async fn write_record(record: &ConsultationRecord, target: Option<PathBuf>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    match target {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("Failed to write to {}", path.display()))?;
            info!("Consultation record written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
