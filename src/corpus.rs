//! Manifest-driven regression harness over a local music corpus.
//!
//! The harness exists to catch tempo/silence regressions that unit tests
//! cannot: real tracks with messy intros, rubato passages and fades. A TSV
//! manifest lists the audio files; each is analyzed for its first 25
//! seconds and the final verdict (BPM, confidence, silence state) is
//! compared against a captured JSON baseline with loose per-corpus gates,
//! so a single odd track cannot fail the suite but a systemic shift will.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::audio::decode;
use crate::audio::pipeline::AudioPipeline;
use crate::audio::spectral::{CHUNK_SIZE, SAMPLE_RATE};

/// Seconds of each track analyzed before reading the verdict.
const ANALYSIS_SECONDS: f32 = 25.0;

const BPM_TOLERANCE: f32 = 1.0;
const CONFIDENCE_TOLERANCE: f32 = 0.20;

const BPM_PASS_RATIO: f64 = 0.98;
const CONFIDENCE_PASS_RATIO: f64 = 0.95;
const SILENCE_PASS_RATIO: f64 = 0.98;

/// One manifest line: an audio path plus an optional hand-labeled BPM.
#[derive(Clone, Debug)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub label_bpm: Option<f32>,
}

/// Final analysis verdict for one track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackVerdict {
    pub path: String,
    pub bpm: f32,
    pub confidence: f32,
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_bpm: Option<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub tracks: Vec<TrackVerdict>,
}

/// Gate tallies from one corpus run.
#[derive(Debug)]
pub struct GateReport {
    pub total: usize,
    pub bpm_passes: usize,
    pub confidence_passes: usize,
    pub silence_matches: usize,
    pub mismatches: Vec<String>,
}

impl GateReport {
    pub fn bpm_ratio(&self) -> f64 {
        self.bpm_passes as f64 / self.total as f64
    }

    pub fn confidence_ratio(&self) -> f64 {
        self.confidence_passes as f64 / self.total as f64
    }

    pub fn silence_ratio(&self) -> f64 {
        self.silence_matches as f64 / self.total as f64
    }

    pub fn passed(&self) -> bool {
        self.bpm_ratio() >= BPM_PASS_RATIO
            && self.confidence_ratio() >= CONFIDENCE_PASS_RATIO
            && self.silence_ratio() >= SILENCE_PASS_RATIO
    }
}

/// Parse a manifest: one `path<TAB>bpm` line per track, the BPM optional.
/// Blank lines and `#` comments are skipped. Relative paths resolve against
/// the manifest's directory.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split('\t');
        let raw_path = match fields.next() {
            Some(p) if !p.is_empty() => p,
            _ => bail!("{}:{}: empty path field", path.display(), lineno + 1),
        };
        let label_bpm = match fields.next() {
            Some(s) if !s.trim().is_empty() => Some(s.trim().parse::<f32>().with_context(
                || format!("{}:{}: bad BPM label {:?}", path.display(), lineno + 1, s),
            )?),
            _ => None,
        };

        let track = base.join(raw_path);
        entries.push(ManifestEntry {
            path: track,
            label_bpm,
        });
    }

    if entries.is_empty() {
        bail!("manifest {} lists no tracks", path.display());
    }
    Ok(entries)
}

/// Decode and run one track through a fresh pipeline, returning the verdict
/// after the analysis window.
pub fn analyze_track(path: &Path, label_bpm: Option<f32>) -> Result<TrackVerdict> {
    let samples = decode::load_pipeline_samples(path)?;
    let limit = (ANALYSIS_SECONDS * SAMPLE_RATE as f32) as usize;
    let window = &samples[..samples.len().min(limit)];

    let mut pipeline = AudioPipeline::new();
    let mut last = None;
    for chunk in window.chunks_exact(CHUNK_SIZE) {
        if let Some(frame) = pipeline.process_chunk(chunk)? {
            last = Some(frame);
        }
    }

    let frame = last.with_context(|| format!("{}: shorter than one hop", path.display()))?;
    Ok(TrackVerdict {
        path: path.display().to_string(),
        bpm: frame.tempo_bpm,
        confidence: frame.tempo_confidence,
        silent: frame.is_silent,
        label_bpm,
    })
}

/// Analyze every manifest entry in parallel with a progress bar.
pub fn analyze_entries(entries: &[ManifestEntry]) -> Result<Vec<TrackVerdict>> {
    let pb = ProgressBar::new(entries.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} tracks ({eta} remaining)")
            .unwrap()
            .progress_chars("=>-"),
    );

    let verdicts: Result<Vec<TrackVerdict>> = entries
        .par_iter()
        .map(|entry| {
            let verdict = analyze_track(&entry.path, entry.label_bpm);
            pb.inc(1);
            verdict
        })
        .collect();
    pb.finish_and_clear();
    verdicts
}

pub fn write_baseline(path: &Path, verdicts: &[TrackVerdict]) -> Result<()> {
    let baseline = Baseline {
        tracks: verdicts.to_vec(),
    };
    let json = serde_json::to_string_pretty(&baseline)?;
    fs::write(path, json).with_context(|| format!("writing baseline {}", path.display()))?;
    log::info!("captured baseline for {} tracks to {}", verdicts.len(), path.display());
    Ok(())
}

pub fn read_baseline(path: &Path) -> Result<Baseline> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading baseline {} (capture one first?)", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Tally the three gates against a baseline. Every analyzed track must be
/// present in the baseline; a missing one means the manifest changed and the
/// baseline needs recapturing.
pub fn compare(verdicts: &[TrackVerdict], baseline: &Baseline) -> Result<GateReport> {
    let by_path: HashMap<&str, &TrackVerdict> = baseline
        .tracks
        .iter()
        .map(|t| (t.path.as_str(), t))
        .collect();

    let mut report = GateReport {
        total: verdicts.len(),
        bpm_passes: 0,
        confidence_passes: 0,
        silence_matches: 0,
        mismatches: Vec::new(),
    };

    for verdict in verdicts {
        let base = by_path.get(verdict.path.as_str()).with_context(|| {
            format!("{}: not in baseline; recapture it", verdict.path)
        })?;

        if (verdict.bpm - base.bpm).abs() <= BPM_TOLERANCE {
            report.bpm_passes += 1;
        } else {
            report
                .mismatches
                .push(format!("{}: bpm {} vs {}", verdict.path, verdict.bpm, base.bpm));
        }

        if (verdict.confidence - base.confidence).abs() <= CONFIDENCE_TOLERANCE {
            report.confidence_passes += 1;
        } else {
            report.mismatches.push(format!(
                "{}: confidence {:.3} vs {:.3}",
                verdict.path, verdict.confidence, base.confidence
            ));
        }

        if verdict.silent == base.silent {
            report.silence_matches += 1;
        } else {
            report.mismatches.push(format!(
                "{}: silent {} vs {}",
                verdict.path, verdict.silent, base.silent
            ));
        }
    }

    Ok(report)
}

/// Run the harness end to end. Returns `None` when capturing a new
/// baseline, otherwise the gate report for the caller to print and judge.
pub fn run(manifest: &Path, baseline: &Path, capture: bool) -> Result<Option<GateReport>> {
    let entries = read_manifest(manifest)?;
    log::info!("analyzing {} corpus tracks", entries.len());
    let verdicts = analyze_entries(&entries)?;

    if capture {
        write_baseline(baseline, &verdicts)?;
        return Ok(None);
    }

    let base = read_baseline(baseline)?;
    let report = compare(&verdicts, &base)?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(path: &str, bpm: f32, confidence: f32, silent: bool) -> TrackVerdict {
        TrackVerdict {
            path: path.to_string(),
            bpm,
            confidence,
            silent,
            label_bpm: None,
        }
    }

    #[test]
    fn manifest_skips_comments_and_parses_labels() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("beatgrid-manifest-{}.tsv", std::process::id()));
        std::fs::write(
            &path,
            "# corpus\n\ntracks/a.flac\t128\ntracks/b.mp3\n",
        )
        .unwrap();

        let entries = read_manifest(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label_bpm, Some(128.0));
        assert!(entries[0].path.ends_with("tracks/a.flac"));
        assert_eq!(entries[1].label_bpm, None);
    }

    #[test]
    fn manifest_rejects_bad_bpm_labels() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("beatgrid-badbpm-{}.tsv", std::process::id()));
        std::fs::write(&path, "a.flac\tnot-a-number\n").unwrap();
        let result = read_manifest(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn gates_tolerate_isolated_misses() {
        let mut tracks = Vec::new();
        for i in 0..100 {
            tracks.push(verdict(&format!("t{}", i), 120.0, 0.9, false));
        }
        let baseline = Baseline {
            tracks: tracks.clone(),
        };

        // One track drifts by 4 BPM, one loses confidence: still passing.
        let mut current = tracks.clone();
        current[3].bpm = 124.0;
        current[7].confidence = 0.5;

        let report = compare(&current, &baseline).unwrap();
        assert_eq!(report.total, 100);
        assert_eq!(report.bpm_passes, 99);
        assert_eq!(report.confidence_passes, 99);
        assert_eq!(report.silence_matches, 100);
        assert!(report.passed());

        // Three BPM drifts cross the 98% gate.
        current[10].bpm = 60.0;
        current[11].bpm = 60.0;
        let report = compare(&current, &baseline).unwrap();
        assert_eq!(report.bpm_passes, 97);
        assert!(!report.passed());
    }

    #[test]
    fn compare_requires_every_track_in_the_baseline() {
        let baseline = Baseline {
            tracks: vec![verdict("known", 120.0, 0.9, false)],
        };
        let current = vec![verdict("unknown", 120.0, 0.9, false)];
        assert!(compare(&current, &baseline).is_err());
    }
}
