//! CLI entry point for resonant_acq.
//!
//! Provides command-line access to:
//! - running an acquisition against the simulated FIFO, optionally logging to disk
//! - inspecting a frame file written by the logger
//! - printing the effective configuration (file plus environment overrides)
//!
//! # Usage
//!
//! ```bash
//! resonant_acq run --frames 200 --log scan.rsf
//! resonant_acq inspect scan.rsf
//! resonant_acq config --config config/resonant_acq.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use resonant_acq::config::ScanConfig;
use resonant_acq::hardware::SimulatedFifo;
use resonant_acq::notify::ChannelNotifier;
use resonant_acq::storage::{FrameFileReader, FrameFileWriter};
use resonant_acq::{tracing_setup, ResonantScanner};

#[derive(Parser)]
#[command(name = "resonant_acq")]
#[command(about = "Resonant scanner frame acquisition and logging", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/resonant_acq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from the simulated FIFO
    Run {
        /// Stop after this many frames have been seen
        #[arg(long, default_value = "100")]
        frames: u64,

        /// Log frames to this file (overrides the configured file and enables logging)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },

    /// Summarize a frame file
    Inspect {
        /// Frame file to read
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ScanConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    tracing_setup::init_from_config(&config)?;

    match cli.command {
        Commands::Run {
            frames,
            log,
            timeout_secs,
        } => {
            if let Some(path) = log {
                config.logging.enabled = true;
                config.logging.file_name = path;
            }
            run(config, frames, Duration::from_secs(timeout_secs))
        }
        Commands::Inspect { file } => inspect(file),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn run(config: ScanConfig, frames: u64, timeout: Duration) -> Result<()> {
    let config = Arc::new(config);
    let interval = Duration::from_millis(config.acquisition.simulated_frame_interval_ms);
    let source = SimulatedFifo::new(config.geometry(), interval);
    let logging = config.logging.enabled;

    let mut scanner = ResonantScanner::new(
        Arc::clone(&config),
        Box::new(source),
        Box::new(FrameFileWriter::new()),
    )?;
    let (notifier, notifications) = ChannelNotifier::new(config.acquisition.queue_capacity);
    scanner.configure_callback(Some(Arc::new(notifier)))?;
    scanner.arm()?;
    scanner.start_acquisition(logging)?;
    tracing::info!(frames, logging, "Acquisition running");

    let started = Instant::now();
    let mut displayed = 0u64;
    while scanner.frames_seen() < frames {
        if started.elapsed() > timeout {
            tracing::warn!(seen = scanner.frames_seen(), "Timed out waiting for frames");
            break;
        }
        if notifications.recv_timeout(Duration::from_millis(100)).is_ok() {
            while scanner.get_frame()?.is_some() {
                displayed += 1;
            }
        }
        let events = scanner.poll_events();
        if !events.is_empty() && !scanner.acquisition_state().is_active() {
            scanner.stop_acquisition()?;
            bail!("acquisition ended early: {events:?}");
        }
    }

    scanner.stop_acquisition()?;
    scanner.poll_events();
    println!("{}", serde_json::to_string_pretty(&scanner.status())?);
    println!("Display frames read: {displayed}");
    if logging {
        println!("Logged to {}", config.logging.file_name.display());
    }
    Ok(())
}

fn inspect(path: PathBuf) -> Result<()> {
    let reader = FrameFileReader::open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let layout = reader.layout();
    println!("File:     {}", path.display());
    println!("Created:  {}", reader.created());
    println!(
        "Layout:   {}x{} x {} channel(s), {} byte(s)/pixel, {}",
        layout.width,
        layout.height,
        layout.channels,
        layout.bytes_per_pixel,
        if layout.signed { "signed" } else { "unsigned" }
    );

    let frames = reader.read_all()?;
    println!("Frames:   {}", frames.len());
    for (i, frame) in frames.iter().enumerate().take(5) {
        let first_line = frame.description.lines().next().unwrap_or_default();
        println!("  [{i}] {}", first_line.trim_end());
    }
    if frames.len() > 5 {
        println!("  ...");
    }
    Ok(())
}
