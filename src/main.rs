mod cli;
mod config;
mod audio;
mod corpus;
mod error;
mod grid;
mod sync;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use audio::features::{AudioTime, ChordType, ControlBusFrame};
use audio::pipeline::AudioPipeline;
use audio::spectral::{CHUNK_SIZE, SAMPLE_RATE};
use cli::Cli;
use grid::{GridTuning, MusicalGrid, MusicalGridSnapshot, TimeSignature};
use sync::SnapshotBuffer;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect beatgrid.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("beatgrid.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("beatgrid").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("beatgrid").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut cfg = config::Config::default();
    if let Some(ref path) = config_path {
        match config::load_config(path) {
            Some(loaded) => {
                log::info!("Loaded config from {}", path.display());
                cfg = loaded;
            }
            None => log::warn!("Failed to load config from {}", path.display()),
        }
    }

    // Merge: config values apply only when CLI is at its default
    if cli.mood == 128 {
        cli.mood = cfg.audio.mood;
    }
    if cli.bpm_min == 30.0 {
        cli.bpm_min = cfg.grid.bpm_min;
    }
    if cli.bpm_max == 300.0 {
        cli.bpm_max = cfg.grid.bpm_max;
    }
    if cli.beats_per_bar == 4 {
        cli.beats_per_bar = cfg.grid.beats_per_bar;
    }
    if cli.beat_unit == 4 {
        cli.beat_unit = cfg.grid.beat_unit;
    }
    if cli.baseline == PathBuf::from("corpus-baseline.json") {
        if let Some(baseline) = cfg.corpus.baseline.clone() {
            cli.baseline = baseline;
        }
    }

    // Corpus mode
    if let Some(manifest_arg) = cli.corpus.clone() {
        let manifest = manifest_arg.or_else(|| cfg.corpus.manifest.clone()).context(
            "no corpus manifest: pass --corpus <path> or set [corpus] manifest in beatgrid.toml",
        )?;
        return run_corpus(&manifest, &cli.baseline, cli.capture_baseline);
    }

    let input = cli.input.as_ref().context("Input audio file is required")?;
    if !input.exists() {
        anyhow::bail!("Input file not found: {}", input.display());
    }

    let samples = audio::decode::load_pipeline_samples(input)?;

    let signature = TimeSignature::new(cli.beats_per_bar, cli.beat_unit);
    let tuning = GridTuning {
        bpm_min: cli.bpm_min,
        bpm_max: cli.bpm_max,
        ..GridTuning::default()
    };
    let silence = (cfg.audio.silence_threshold, cfg.audio.silence_hold_ms);

    if cli.live {
        if cli.dump.is_some() {
            log::warn!("--dump is ignored in live mode");
        }
        return run_live(samples, cli.mood, silence, signature, tuning);
    }

    run_offline(
        input,
        &samples,
        cli.mood,
        silence,
        signature,
        tuning,
        cli.dump.as_deref(),
    )
}

fn run_corpus(manifest: &std::path::Path, baseline: &std::path::Path, capture: bool) -> Result<()> {
    match corpus::run(manifest, baseline, capture)? {
        None => Ok(()),
        Some(report) => {
            println!("corpus: {} tracks", report.total);
            println!("  bpm        {:>5.1}% (gate 98%)", report.bpm_ratio() * 100.0);
            println!(
                "  confidence {:>5.1}% (gate 95%)",
                report.confidence_ratio() * 100.0
            );
            println!("  silence    {:>5.1}% (gate 98%)", report.silence_ratio() * 100.0);
            for mismatch in &report.mismatches {
                println!("  mismatch: {}", mismatch);
            }
            if report.passed() {
                println!("PASS");
                Ok(())
            } else {
                anyhow::bail!("corpus gates failed")
            }
        }
    }
}

#[derive(Default)]
struct RunStats {
    frames: usize,
    silent_frames: usize,
    grid_ticks: usize,
    grid_downbeats: usize,
    chords: HashMap<String, u32>,
    last_frame: Option<ControlBusFrame>,
    last_snap: Option<MusicalGridSnapshot>,
}

fn run_offline(
    input: &std::path::Path,
    samples: &[f32],
    mood: u8,
    silence: (f32, f32),
    signature: TimeSignature,
    tuning: GridTuning,
    dump: Option<&std::path::Path>,
) -> Result<()> {
    let mut pipeline = AudioPipeline::new();
    pipeline.set_mood_smoothing(mood);
    pipeline.set_silence_parameters(silence.0, silence.1);

    let mut grid = MusicalGrid::new(tuning);
    grid.set_time_signature(signature);

    // Offline still routes frames through the snapshot buffer, so the
    // producer/consumer handoff is exercised deterministically.
    let bus = SnapshotBuffer::new(ControlBusFrame::default());

    let mut dump_writer = match dump {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            writeln!(
                writer,
                "hop\tseconds\trms\tflux\tvu\tb0\tb1\tb2\tb3\tb4\tb5\tb6\tb7\tbpm\t\
                 confidence\tlocked\ttick\tphase01\tbeat_in_bar\tchord\tliveliness\t\
                 silent_scale\tsilent"
            )?;
            Some(writer)
        }
        None => None,
    };

    let mut stats = RunStats::default();
    for chunk in samples.chunks_exact(CHUNK_SIZE) {
        let published = match pipeline.process_chunk(chunk)? {
            Some(frame) => frame,
            None => continue,
        };
        bus.publish(published);
        let (frame, _) = bus.read_latest();

        feed_grid(&mut grid, &frame);
        let snap = grid.tick(frame.t);

        stats.frames += 1;
        if frame.is_silent {
            stats.silent_frames += 1;
        }
        if snap.beat_tick {
            stats.grid_ticks += 1;
        }
        if snap.downbeat_tick {
            stats.grid_downbeats += 1;
        }
        if frame.chord.kind != ChordType::None {
            let name = format!("{}{}", frame.chord.root_name(), frame.chord.kind.as_str());
            *stats.chords.entry(name).or_insert(0) += 1;
        }

        if let Some(writer) = dump_writer.as_mut() {
            write_dump_row(writer, &frame)?;
        }

        stats.last_frame = Some(frame);
        stats.last_snap = Some(snap);
    }

    if let Some(mut writer) = dump_writer {
        writer.flush()?;
    }

    if stats.frames == 0 {
        anyhow::bail!("input shorter than one hop");
    }
    print_summary(input, samples, &stats);
    Ok(())
}

fn write_dump_row(writer: &mut BufWriter<File>, frame: &ControlBusFrame) -> Result<()> {
    write!(
        writer,
        "{}\t{:.3}\t{:.4}\t{:.4}\t{:.4}",
        frame.hop_seq,
        frame.t.as_seconds(),
        frame.rms,
        frame.flux,
        frame.vu_level
    )?;
    for band in &frame.bands {
        write!(writer, "\t{:.4}", band)?;
    }
    let chord = if frame.chord.kind == ChordType::None {
        "-".to_string()
    } else {
        format!("{}{}", frame.chord.root_name(), frame.chord.kind.as_str())
    };
    writeln!(
        writer,
        "\t{:.1}\t{:.4}\t{}\t{}\t{:.4}\t{}\t{}\t{:.4}\t{:.4}\t{}",
        frame.tempo_bpm,
        frame.tempo_confidence,
        frame.tempo_locked as u8,
        frame.beat_tick as u8,
        frame.beat_phase01,
        frame.beat_in_bar,
        chord,
        frame.liveliness,
        frame.silent_scale,
        frame.is_silent as u8
    )?;
    Ok(())
}

fn print_summary(input: &std::path::Path, samples: &[f32], stats: &RunStats) {
    let duration = samples.len() as f64 / SAMPLE_RATE as f64;
    let total = stats.frames.max(1);

    println!();
    println!("{}", input.display());
    println!("  duration    {:>8.1} s ({} hops)", duration, stats.frames);
    if let Some(frame) = &stats.last_frame {
        println!(
            "  bpm         {:>8.1} (confidence {:.2}{})",
            frame.tempo_bpm,
            frame.tempo_confidence,
            if frame.tempo_locked { ", locked" } else { "" }
        );
    }
    if let Some(snap) = &stats.last_snap {
        println!(
            "  grid        {:>8.1} bpm, {} beats / {} bars",
            snap.bpm_smoothed, snap.beat_index, snap.bar_index
        );
    }
    println!(
        "  beat ticks  {:>8} ({} downbeats)",
        stats.grid_ticks, stats.grid_downbeats
    );
    println!(
        "  silence     {:>7.1}%",
        100.0 * stats.silent_frames as f64 / total as f64
    );

    let mut chords: Vec<(&String, &u32)> = stats.chords.iter().collect();
    chords.sort_by(|a, b| b.1.cmp(a.1));
    if !chords.is_empty() {
        let line = chords
            .iter()
            .take(4)
            .map(|(name, n)| format!("{} {:.0}%", name, 100.0 * **n as f64 / total as f64))
            .collect::<Vec<_>>()
            .join("  ");
        println!("  chords      {}", line);
    }
}

/// Bridge one published frame into the beat clock. Locked estimates carry a
/// small confidence boost; beat observations pass through time-stamped.
fn feed_grid(grid: &mut MusicalGrid, frame: &ControlBusFrame) {
    let mut confidence = frame.tempo_confidence;
    if frame.tempo_locked && confidence > 0.5 {
        confidence = confidence * 0.9 + 0.1;
    }
    grid.on_tempo_estimate(frame.tempo_bpm, confidence);
    if frame.beat_tick {
        grid.on_beat_observation(frame.t, frame.beat_strength, frame.downbeat_tick);
    }
}

fn run_live(
    samples: Vec<f32>,
    mood: u8,
    silence: (f32, f32),
    signature: TimeSignature,
    tuning: GridTuning,
) -> Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    let duration = samples.len() as f64 / SAMPLE_RATE as f64;
    log::info!("live mode: {:.1}s of audio", duration);

    let bus = Arc::new(SnapshotBuffer::new(ControlBusFrame::default()));
    let done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let producer = {
        let bus = Arc::clone(&bus);
        let done = Arc::clone(&done);
        std::thread::spawn(move || -> Result<()> {
            let mut pipeline = AudioPipeline::new();
            pipeline.set_mood_smoothing(mood);
            pipeline.set_silence_parameters(silence.0, silence.1);

            let chunk_period =
                Duration::from_micros(CHUNK_SIZE as u64 * 1_000_000 / SAMPLE_RATE as u64);
            let mut next_deadline = Duration::ZERO;
            for chunk in samples.chunks_exact(CHUNK_SIZE) {
                // The done flag must be stored on every exit path or the
                // consumer loop never terminates.
                match pipeline.process_chunk(chunk) {
                    Ok(Some(frame)) => bus.publish(frame),
                    Ok(None) => {}
                    Err(e) => {
                        done.store(true, Ordering::Release);
                        return Err(e.into());
                    }
                }
                next_deadline += chunk_period;
                let elapsed = start.elapsed();
                if next_deadline > elapsed {
                    std::thread::sleep(next_deadline - elapsed);
                }
            }
            done.store(true, Ordering::Release);
            Ok(())
        })
    };

    let mut grid = MusicalGrid::new(tuning);
    grid.set_time_signature(signature);

    let frame_period = Duration::from_millis(8);
    let mut last_seq = 0u32;
    let mut last_status = Instant::now();
    while !done.load(Ordering::Acquire) {
        let (frame, seq) = bus.read_latest();
        if seq != last_seq {
            last_seq = seq;
            feed_grid(&mut grid, &frame);
        }

        let elapsed = start.elapsed();
        let render_now = AudioTime::new(
            (elapsed.as_secs_f64() * SAMPLE_RATE as f64) as u64,
            SAMPLE_RATE,
            elapsed.as_micros() as u64,
        );
        let snap = grid.tick(render_now);

        if last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            log::info!(
                "{:6.1}s  bpm {:5.1}  conf {:.2}  beat {}/{}  phase {:.2}{}",
                elapsed.as_secs_f64(),
                snap.bpm_smoothed,
                snap.tempo_confidence,
                snap.beat_in_bar + 1,
                snap.beats_per_bar,
                snap.beat_phase01,
                if frame.is_silent { "  [silent]" } else { "" }
            );
        }
        std::thread::sleep(frame_period);
    }

    match producer.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("producer thread panicked"),
    }
    Ok(())
}
