use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "tempo-player", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Output backend
    #[arg(long, value_enum, default_value_t = OutputArg::Cpal)]
    pub output: OutputArg,

    /// Format of the per-session transcoded file
    #[arg(long, value_enum, default_value_t = ExportArg::Aac)]
    pub export_format: ExportArg,

    /// ffmpeg executable used for AAC export
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Directory for the transcoded scratch file (default: per-process temp dir)
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Render chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Output callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Decoded audio buffered ahead of the player, in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the library listing for a directory
    List {
        /// Directory to scan
        dir: PathBuf,
    },

    /// Play one file or file:// URL and read commands from stdin
    Play {
        /// Path or file:// URL
        locator: String,

        /// Initial playback rate (1.0 = unchanged)
        #[arg(long)]
        tempo: Option<f32>,
    },

    /// List a directory and pick items to play interactively
    Browse {
        /// Directory to scan
        dir: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputArg {
    Cpal,
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExportArg {
    Aac,
    Wav,
}
