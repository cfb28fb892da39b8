//! chat-calls - call core tooling
//!
//! Runs simulated calls over the in-process loopback and exercises the
//! signaling and video conversion pieces from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_calls::calling::codec::IceCandidateRecord;
use chat_calls::calling::frame::{i420_to_bgra, I420Planes};
use chat_calls::calling::ice;
use chat_calls::calling::peer::SessionDescription;
use chat_calls::calling::push::PushPayload;
use chat_calls::calling::signaling::TransportEvent;
use chat_calls::calling::simulate::{self, SimulationOptions};
use chat_calls::config::Config;

#[derive(Parser)]
#[command(name = "chat-calls")]
#[command(about = "Peer-to-peer calls signaled over chat messages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a raw I420 file to packed BGRA
    Convert {
        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,

        /// Packed I420 input (Y, U, V planes back to back)
        input: PathBuf,

        /// BGRA output
        output: PathBuf,
    },

    /// Parse a call push payload and show the event it carries
    Push {
        /// Payload JSON (bare or wrapped in a `payload` envelope)
        json: String,
    },

    /// Decode an ICE trickle record
    Candidate {
        /// Record JSON as sent over the signaling channel
        json: String,
    },

    /// Run a call between two in-process accounts
    Simulate {
        /// Callee declines instead of answering
        #[arg(long)]
        decline: bool,

        /// Remote video frames to send once connected
        #[arg(long, default_value = "0")]
        video_frames: u32,

        /// Seconds to keep the connected call up
        #[arg(long, default_value = "1")]
        hold: u64,

        /// Show the callee's remote video in a window (requires sdl-display feature)
        #[arg(long)]
        display: bool,
    },

    /// Show the configuration
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Convert {
            width,
            height,
            input,
            output,
        } => convert(width, height, &input, &output)?,
        Commands::Push { json } => describe_push(&json)?,
        Commands::Candidate { json } => describe_candidate(&json)?,
        Commands::Simulate {
            decline,
            video_frames,
            hold,
            display,
        } => {
            let config = Config::load().context("Failed to load config")?;
            let options = SimulationOptions {
                decline,
                video_frames,
                hold: Duration::from_secs(hold),
            };
            simulate::run_simulation(&config.call_settings(), &options, open_display(display)?)
                .await?;
        }
        Commands::Config { init } => show_config(init)?,
    }

    Ok(())
}

fn convert(width: u32, height: u32, input: &Path, output: &Path) -> Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let planes = I420Planes::from_packed(width, height, Bytes::from(data))?;
    let image = i420_to_bgra(&planes)?;
    std::fs::write(output, &image.data)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "{}x{} I420 -> {} bytes BGRA ({} bytes/row)",
        image.width,
        image.height,
        image.data.len(),
        image.bytes_per_row
    );
    Ok(())
}

fn describe_push(json: &str) -> Result<()> {
    let payload = PushPayload::parse(json)?;
    println!("event:   {:?}", payload.event_id);
    println!("account: {}", payload.account_id);
    println!("message: {}", payload.message_id);
    match payload.into_event() {
        TransportEvent::IncomingCall { offer: Some(offer), .. } => {
            let offer = SessionDescription::offer(offer);
            println!(
                "offer:   {} bytes, {} candidates",
                offer.sdp.len(),
                offer.candidate_count()
            );
        }
        TransportEvent::IncomingCall { offer: None, .. } => {
            println!("offer:   missing (the call would be aborted)");
        }
        _ => {}
    }
    Ok(())
}

fn describe_candidate(json: &str) -> Result<()> {
    let record = IceCandidateRecord::from_json(json.as_bytes())?;
    let line = ice::parse_candidate(&record.candidate)?;
    println!("type:      {:?}", line.candidate_type);
    println!("transport: {:?}", line.transport);
    println!("address:   {}:{}", line.address, line.port);
    println!("priority:  {}", line.priority);
    println!("m-line:    {}", record.sdp_mline_index);
    if let Some(mid) = &record.sdp_mid {
        println!("mid:       {}", mid);
    }
    Ok(())
}

fn show_config(init: bool) -> Result<()> {
    let path = Config::config_path()?;
    if init && !path.exists() {
        let written = Config::default().save()?;
        println!("Wrote {}", written.display());
    }
    let config = Config::load()?;
    println!("# {}", path.display());
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(feature = "sdl-display")]
fn open_display(
    enabled: bool,
) -> Result<Option<std::sync::Arc<dyn chat_calls::calling::frame::DisplaySurface>>> {
    if !enabled {
        return Ok(None);
    }
    let display = chat_calls::calling::display::SdlDisplay::start("chat-calls video")?;
    Ok(Some(std::sync::Arc::new(display)))
}

#[cfg(not(feature = "sdl-display"))]
fn open_display(
    enabled: bool,
) -> Result<Option<std::sync::Arc<dyn chat_calls::calling::frame::DisplaySurface>>> {
    if enabled {
        anyhow::bail!("Built without the sdl-display feature");
    }
    Ok(None)
}
