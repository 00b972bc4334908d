use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "beatgrid", about = "Beat, tempo and loudness analysis for audio files")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG, AAC)
    pub input: Option<PathBuf>,

    /// Config file path (default: auto-detect beatgrid.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write per-hop features to a TSV file
    #[arg(long)]
    pub dump: Option<PathBuf>,

    /// Run the corpus regression harness; the manifest path falls back to
    /// the config's [corpus] section when omitted
    #[arg(long, value_name = "MANIFEST")]
    pub corpus: Option<Option<PathBuf>>,

    /// Rewrite the corpus baseline instead of comparing against it
    #[arg(long)]
    pub capture_baseline: bool,

    /// Corpus baseline JSON path
    #[arg(long, default_value = "corpus-baseline.json")]
    pub baseline: PathBuf,

    /// Pace the pipeline in real time on separate producer/consumer threads
    #[arg(long)]
    pub live: bool,

    /// Envelope smoothing 0-255: low is snappy, high is syrupy
    #[arg(long, default_value_t = 128)]
    pub mood: u8,

    /// Beats per bar for the beat/bar clock
    #[arg(long, default_value_t = 4)]
    pub beats_per_bar: u8,

    /// Beat unit for the beat/bar clock
    #[arg(long, default_value_t = 4)]
    pub beat_unit: u8,

    /// Minimum BPM the beat clock will lock to
    #[arg(long, default_value_t = 30.0)]
    pub bpm_min: f32,

    /// Maximum BPM the beat clock will lock to
    #[arg(long, default_value_t = 300.0)]
    pub bpm_max: f32,
}
