//! PeerCall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Signaling relay URL
    #[arg(long, env = "PEERCALL_RELAY_URL")]
    relay: Option<String>,

    /// STUN server URL (repeatable)
    #[arg(long, env = "PEERCALL_STUN", value_delimiter = ',')]
    stun: Vec<String>,

    /// JSON configuration file
    #[arg(long, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Do not capture video
    #[arg(long)]
    no_video: bool,

    /// Do not capture audio
    #[arg(long)]
    no_audio: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Call whoever else is connected to the relay
    Call {
        /// Turn local video on once the call is placed
        #[arg(long)]
        video_on: bool,
    },

    /// Wait for incoming calls
    Listen,

    /// Show the resolved configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Call { video_on } => handle_call(config, video_on).await?,
        Commands::Listen => handle_listen(config).await?,
        Commands::Status => handle_status(&config)?,
    }

    Ok(())
}

/// Defaults, then the config file, then flags and environment
fn resolve_config(cli: &Cli) -> Result<PeerCallConfig> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) if path.exists() => load_config(&path)?,
        Some(path) if cli.config.is_some() => {
            anyhow::bail!("config file {} does not exist", path.display())
        }
        _ => PeerCallConfig::default(),
    };

    if let Some(relay) = &cli.relay {
        config.transport.relay_url = relay.clone();
    }
    if !cli.stun.is_empty() {
        config.ice_servers = cli.stun.clone();
    }
    if cli.no_video {
        config.media.video = false;
    }
    if cli.no_audio {
        config.media.audio = false;
    }
    Ok(config)
}

fn load_config(path: &Path) -> Result<PeerCallConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "peercall", "peercall")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

async fn build_controller(config: PeerCallConfig) -> Result<CallController<WebSocketTransport>> {
    let transport = Arc::new(WebSocketTransport::new(config.transport.clone()));
    let controller = CallController::builder(transport)
        .with_config(config)
        .with_capture(Arc::new(SyntheticCapture::new()))
        .build()?;
    controller.start().await?;
    println!("✅ Connected to relay {}", controller.config().transport.relay_url);
    Ok(controller)
}

async fn handle_call(config: PeerCallConfig, video_on: bool) -> Result<()> {
    let controller = build_controller(config).await?;

    let mut events = controller.subscribe_events();
    let call_id = controller.call().await?;
    println!("📞 Calling (call {call_id})...");
    if video_on {
        controller.start_local_video()?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::CallEnded { reason, .. }) => {
                    println!("📴 Call ended: {reason:?}");
                    break;
                }
                Ok(event) => print_event(&event),
                Err(e) => {
                    tracing::error!("Event stream error: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("📴 Hanging up");
                controller.hang_up().await?;
                break;
            }
        }
    }

    controller.shutdown().await;
    Ok(())
}

async fn handle_listen(config: PeerCallConfig) -> Result<()> {
    let controller = build_controller(config).await?;
    println!("👂 Waiting for calls, Ctrl-C to quit");

    let mut events = controller.subscribe_events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged { to: CallState::Negotiating(Role::Callee), .. }) => {
                    println!("📞 Incoming call, answering");
                }
                Ok(CallEvent::CallEnded { reason, .. }) => {
                    println!("📴 Call ended: {reason:?}, waiting for the next one");
                }
                Ok(event) => print_event(&event),
                Err(e) => {
                    tracing::error!("Event stream error: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.shutdown().await;
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged { to: CallState::Active, .. } => println!("✅ Call active"),
        CallEvent::RemoteTrack { kind, track_id, .. } => {
            println!("🎥 Remote {kind} track {track_id}");
        }
        CallEvent::Error { message } => println!("⚠️  {message}"),
        other => tracing::debug!("Received event: {:?}", other),
    }
}

fn handle_status(config: &PeerCallConfig) -> Result<()> {
    println!("📊 PeerCall Status");
    println!("==================");
    println!("{}", serde_json::to_string_pretty(config)?);
    if let Some(path) = default_config_path() {
        println!();
        println!("Config file: {}", path.display());
    }
    println!();
    println!("Available commands:");
    println!("  peercall call     - Call the other party on the relay");
    println!("  peercall listen   - Answer incoming calls");
    println!("  peercall status   - Show this status");

    Ok(())
}
