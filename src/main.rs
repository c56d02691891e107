//! cavewarp - head-tracked projection service for CAVE installations
//!
//! Loads the installation, computes warp, projection and view matrices for
//! every surface at the render rate, and serves calibration and frame data
//! over HTTP for the renderer and the calibration UI.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cavewarp::config::Config;
use cavewarp::frame::{compute_frame, run_frame_loop};
use cavewarp::server::{self, AppState};
use cavewarp::topology::Topology;
use cavewarp::warp::WarpCache;

/// cavewarp - quad-warp and off-axis projection for immersive displays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "cavewarp.toml")]
    config: PathBuf,

    /// Web server host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Web server port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Target frame rate (overrides the config file)
    #[arg(long)]
    fps: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print one frame at the rest head position as JSON and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging, RUST_LOG wins over --verbose
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    info!("cavewarp v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = Config::load_or_create(&args.config)?;

    // CLI args override config file values
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(fps) = args.fps {
        config.render.fps = fps;
    }
    config.validate().context("Invalid command line overrides")?;

    if args.once {
        return print_single_frame(&config);
    }

    info!(
        "Installation: {} surfaces, {} screens, {} projectors, kave scale {}",
        config.surfaces.len(),
        config.screens.len(),
        config.projectors.len(),
        config.kave_scale
    );
    info!("Render rate: {} fps", config.render.fps);
    match config.sensor.body_id {
        Some(body) => info!("Head tracker: {:?}, body {}", config.sensor.kind, body),
        None => info!("Head tracker: {:?}", config.sensor.kind),
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let config = Arc::new(parking_lot::RwLock::new(config));

    // Shared state for live calibration, head input and frame output
    let state = Arc::new(AppState::new(config, args.config.clone())?);

    // Start the frame loop
    let loop_state = state.clone();
    let frame_handle = tokio::task::spawn_blocking(move || run_frame_loop(loop_state));

    // Start the web server
    info!("Starting control API at http://{}", addr);
    let server_state = state.clone();
    let server_handle = tokio::spawn(async move { server::run_server(&addr, server_state).await });

    // Wait for either to finish (or error)
    tokio::select! {
        result = frame_handle => {
            match result {
                Ok(Ok(())) => info!("Frame loop exited normally"),
                Ok(Err(e)) => tracing::error!("Frame loop error: {}", e),
                Err(e) => tracing::error!("Frame loop task panicked: {}", e),
            }
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => tracing::error!("Server error: {}", e),
                Err(e) => tracing::error!("Server task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
        }
    }

    state.request_shutdown();
    Ok(())
}

/// Compute one frame without starting the service
fn print_single_frame(config: &Config) -> Result<()> {
    let topology = Topology::from_config(config, None)?;
    let frame = compute_frame(&topology, &WarpCache::new(), topology.rest_head(), topology.clip, 0);

    for skipped in &frame.skipped {
        tracing::warn!("Surface {} skipped: {}", skipped.surface, skipped.reason);
    }

    println!("{}", serde_json::to_string_pretty(&frame)?);
    Ok(())
}
