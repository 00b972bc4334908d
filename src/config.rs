use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
}

#[derive(Debug, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_bpm_min")]
    pub bpm_min: f32,
    #[serde(default = "default_bpm_max")]
    pub bpm_max: f32,
    #[serde(default = "default_beats_per_bar")]
    pub beats_per_bar: u8,
    #[serde(default = "default_beat_unit")]
    pub beat_unit: u8,
}

#[derive(Debug, Deserialize)]
pub struct AudioConfig {
    /// Envelope smoothing 0-255: low is snappy, high is syrupy.
    #[serde(default = "default_mood")]
    pub mood: u8,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    #[serde(default = "default_silence_hold_ms")]
    pub silence_hold_ms: f32,
}

#[derive(Debug, Default, Deserialize)]
pub struct CorpusConfig {
    pub manifest: Option<PathBuf>,
    pub baseline: Option<PathBuf>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            bpm_min: default_bpm_min(),
            bpm_max: default_bpm_max(),
            beats_per_bar: default_beats_per_bar(),
            beat_unit: default_beat_unit(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mood: default_mood(),
            silence_threshold: default_silence_threshold(),
            silence_hold_ms: default_silence_hold_ms(),
        }
    }
}

fn default_bpm_min() -> f32 { 30.0 }
fn default_bpm_max() -> f32 { 300.0 }
fn default_beats_per_bar() -> u8 { 4 }
fn default_beat_unit() -> u8 { 4 }
fn default_mood() -> u8 { 128 }
fn default_silence_threshold() -> f32 { 0.01 }
fn default_silence_hold_ms() -> f32 { 5000.0 }

pub fn load_config(path: &PathBuf) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_missing_sections_with_defaults() {
        let cfg: Config = toml::from_str(
            "[grid]\nbpm_min = 60.0\n\n[corpus]\nmanifest = \"corpus.tsv\"\n",
        )
        .unwrap();

        assert_eq!(cfg.grid.bpm_min, 60.0);
        assert_eq!(cfg.grid.bpm_max, 300.0);
        assert_eq!(cfg.grid.beats_per_bar, 4);
        assert_eq!(cfg.audio.mood, 128);
        assert_eq!(cfg.corpus.manifest, Some(PathBuf::from("corpus.tsv")));
        assert_eq!(cfg.corpus.baseline, None);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.audio.silence_threshold, 0.01);
        assert_eq!(cfg.audio.silence_hold_ms, 5000.0);
        assert_eq!(cfg.grid.beat_unit, 4);
    }
}
