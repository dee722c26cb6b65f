use clap::Parser;
use std::path::PathBuf;

#[cfg(feature = "audio-device")]
const AUDIO_BACKEND: &str = "cpal device";
#[cfg(not(feature = "audio-device"))]
const AUDIO_BACKEND: &str = "null sink (software timer)";

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Audio:  ", AUDIO_BACKEND, "\n",
    "Video:  playa-ffmpeg 8.0 (static)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Headless playback engine driver: render frames with burned-in subtitles
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Media file to open (any container FFmpeg can read)
    #[arg(value_name = "FILE", required_unless_present = "pattern", conflicts_with = "pattern")]
    pub file_path: Option<PathBuf>,

    /// Use a synthetic 10s 30fps test pattern instead of a file
    #[arg(long = "pattern")]
    pub pattern: bool,

    /// Subtitle script (ASS/SSA markup) to burn in
    #[arg(short = 's', long = "subs", value_name = "FILE")]
    pub subs: Option<PathBuf>,

    /// Render at this media time in seconds (repeatable)
    #[arg(short = 't', long = "at", value_name = "SECONDS")]
    pub at: Vec<f64>,

    /// Seek here before rendering
    #[arg(long = "seek", value_name = "SECONDS")]
    pub seek: Option<f64>,

    /// Write the last presented frame as PNG
    #[arg(short = 'o', long = "snapshot", value_name = "OUT.png")]
    pub snapshot: Option<PathBuf>,

    /// Enable debug logging to file
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}
