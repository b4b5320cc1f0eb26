//! # Segue
//!
//! Command-line playlist player for the Segue engine.
//!
//! Streams are driven by the simulated media graph, whose clock runs
//! `--speed` times faster than wall time, so transitions between tracks
//! can be watched in the log without any audio hardware.

mod services;

use anyhow::{Context, Result};
use clap::Parser;
use segue_core::{EngineConfig, PlayType};
use segue_engine::sim::SimGraph;
use segue_engine::{Engine, NoHooks};
use services::PlaylistService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the simulated clock and the notification queue are serviced.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "segue")]
#[command(about = "Play a list of URIs with gapless or crossfaded transitions")]
#[command(version)]
struct Args {
    /// URIs to play, in order
    #[arg(required = true)]
    uris: Vec<String>,

    /// Transition between tracks: replace, after-eos, or crossfade
    #[arg(short, long, default_value = "crossfade", env = "SEGUE_MODE")]
    mode: PlayType,

    /// Crossfade length in milliseconds (defaults to the configured value)
    #[arg(long, env = "SEGUE_CROSSFADE_MS")]
    crossfade_ms: Option<u64>,

    /// Simulated length of every track in seconds
    #[arg(short, long, default_value = "20", env = "SEGUE_DURATION_SECS")]
    duration_secs: u64,

    /// Simulated seconds per wall-clock second
    #[arg(short, long, default_value = "10.0", env = "SEGUE_SPEED")]
    speed: f64,

    /// Configuration file (defaults to the per-user config)
    #[arg(short, long, env = "SEGUE_CONFIG")]
    config: Option<PathBuf>,

    /// Output volume between 0.0 and 1.0
    #[arg(short, long, env = "SEGUE_VOLUME")]
    volume: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segue=info,segue_engine=debug".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting Segue v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::load().context("Failed to load config")?,
    };
    let crossfade = args
        .crossfade_ms
        .map_or_else(|| config.crossfade(), Duration::from_millis);

    if !(args.speed.is_finite() && args.speed > 0.0) {
        anyhow::bail!("--speed must be a positive number, got {}", args.speed);
    }
    let step = POLL_INTERVAL.mul_f64(args.speed);

    let sim = SimGraph::new();
    sim.set_default_duration(Some(Duration::from_secs(args.duration_secs)));

    let engine = Engine::new(Arc::new(sim.clone()), Arc::new(NoHooks), config)
        .context("Failed to create playback engine")?;
    if let Some(volume) = args.volume {
        engine.set_volume(volume);
    }
    engine
        .run_event_loop()
        .context("Failed to start event loop")?;

    let mut service = PlaylistService::new(engine, args.uris, args.mode, crossfade);
    service.start().context("Failed to start playback")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !service.is_finished() {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                info!("Interrupted");
                break;
            }
            () = tokio::time::sleep(POLL_INTERVAL) => {
                sim.advance(step);
                service.poll()?;
            }
        }
    }

    service.engine().shutdown();
    info!("Done");
    Ok(())
}
