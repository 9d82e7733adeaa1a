//! Tempo Player: plays local audio files through a tempo-adjustable engine.
//!
//! ## Pipeline
//! 1. **Export**: the source is transcoded into a single scratch file (AAC via ffmpeg, or WAV).
//! 2. **Render**: a background thread decodes the scratch file and runs it through the
//!    variable-speed and pitch-shift stages.
//! 3. **Output**: the mixer feeds the CPAL callback (or a headless sink) without blocking.
//!
//! ## Modes
//! - `list`: print a directory's playable items sorted by artist and title.
//! - `play`: play one file and take commands on stdin.
//! - `browse`: list a directory and pick items to play.

mod cli;
mod config;
mod library;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tempo_engine=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let Some(cmd) = &args.cmd else {
        anyhow::bail!("no command given (see --help)");
    };

    let engine_config = config::engine_config(&args);
    let cleanup = config::interrupt_cleanup(&engine_config);
    let _ = ctrlc::set_handler(move || {
        cleanup();
        std::process::exit(130);
    });

    match cmd {
        cli::Command::List { dir } => runtime::run_list(dir),
        cli::Command::Play { locator, tempo } => {
            runtime::run_play(engine_config, locator, *tempo)
        }
        cli::Command::Browse { dir } => runtime::run_browse(engine_config, dir),
    }
}
