use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "multi-transcode")]
#[command(about = "Assemble a multi-rendition transcode graph and print its wiring")]
pub struct Cli {
    /// Encoding target, optionally restricted to one profile: TARGET[/PROFILE].
    /// Defaults to the built-in HLS ladder.
    pub target: Option<String>,

    /// List known targets with the profiles usable on this system.
    #[arg(long)]
    pub list_targets: bool,

    /// JSON file with one target or an array of targets.
    #[arg(long = "targets", value_name = "FILE")]
    pub target_files: Vec<PathBuf>,

    /// JSON preset store; created if missing.
    #[arg(long, value_name = "FILE")]
    pub presets: Option<PathBuf>,

    /// Parent directory of the per-profile outputs.
    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    /// Target segment duration in seconds (0 = unbounded).
    #[arg(long, default_value_t = 3)]
    pub target_duration: u32,

    /// Caps of a stream carried by the main input (repeatable).
    #[arg(long = "stream", value_name = "CAPS")]
    pub streams: Vec<String>,

    /// Probe this file or URL for the main input's streams.
    #[cfg(feature = "ffmpeg")]
    #[arg(long)]
    pub input: Option<String>,

    /// Write the assembled graph in Graphviz format.
    #[arg(long, value_name = "FILE")]
    pub dot: Option<PathBuf>,

    /// Print the wiring summary as JSON.
    #[arg(long)]
    pub json: bool,
}
