//! Chunk-cadence driver for the DSP stages.
//!
//! Callers feed fixed 64-sample chunks; every fourth chunk closes a
//! 256-sample hop and the pipeline folds the DSP state through the adapter
//! and control stages into one [`ControlBusFrame`]. All timing derives from
//! the sample counter, so a given input stream always produces the same
//! frame sequence regardless of wall-clock jitter in the caller.

use crate::audio::adapter::{BackendAdapter, RawDspOutputs};
use crate::audio::chroma::Chromagram;
use crate::audio::control::ControlStage;
use crate::audio::features::{AudioTime, ControlBusFrame, WAVEFORM_LENGTH};
use crate::audio::history::SampleHistory;
use crate::audio::novelty::{NoveltyTracker, NOVELTY_HISTORY_LENGTH};
use crate::audio::spectral::{SpectralAnalyzer, CHUNK_SIZE, SAMPLE_RATE};
use crate::audio::tempo::TempoEstimator;
use crate::audio::vu::VuMeter;
use crate::audio::window::WindowLookup;
use crate::error::{PipelineError, Result};

/// Chunks folded into one published hop.
pub const CHUNKS_PER_HOP: usize = 4;
/// Samples per published hop.
pub const HOP_SIZE: usize = CHUNK_SIZE * CHUNKS_PER_HOP;
/// Publish rate at the native sample rate.
pub const HOP_RATE_HZ: f32 = SAMPLE_RATE as f32 / HOP_SIZE as f32;

/// Reference-frame advance per chunk for the beat-phase integrators: the
/// phase tables assume 100 reference frames per second against the 200 Hz
/// chunk rate.
const PHASE_DELTA_PER_CHUNK: f32 = 0.5;

/// A tick landing closer than this fraction of a beat period to the
/// previous one is dropped as resonator chatter.
const TICK_DEBOUNCE_RATIO: f32 = 0.6;

/// Owns every DSP stage plus the hop assembly state.
pub struct AudioPipeline {
    history: SampleHistory,
    window: WindowLookup,
    spectral: SpectralAnalyzer,
    vu: VuMeter,
    chroma: Chromagram,
    novelty: NoveltyTracker,
    tempo: TempoEstimator,
    adapter: BackendAdapter,
    control: ControlStage,

    hop_buffer: [f32; HOP_SIZE],
    chunk_in_hop: usize,
    sample_index: u64,
    hop_seq: u32,

    last_winner_phase: f32,
    last_tick_ms: u64,
}

impl AudioPipeline {
    pub fn new() -> Self {
        AudioPipeline {
            history: SampleHistory::new(),
            window: WindowLookup::new(),
            spectral: SpectralAnalyzer::new(),
            vu: VuMeter::new(),
            chroma: Chromagram::new(),
            novelty: NoveltyTracker::new(),
            tempo: TempoEstimator::new(),
            adapter: BackendAdapter::new(),
            control: ControlStage::new(),
            hop_buffer: [0.0; HOP_SIZE],
            chunk_in_hop: 0,
            sample_index: 0,
            hop_seq: 0,
            last_winner_phase: 0.0,
            last_tick_ms: 0,
        }
    }

    /// Run one chunk of zero-centered samples in [-1, 1] through every DSP
    /// stage. Returns a frame on each hop boundary (every fourth chunk),
    /// `None` otherwise. Chunks must be exactly [`CHUNK_SIZE`] samples.
    pub fn process_chunk(&mut self, chunk: &[f32]) -> Result<Option<ControlBusFrame>> {
        if chunk.len() != CHUNK_SIZE {
            return Err(PipelineError::InvalidArgument(format!(
                "chunk length {} != {}",
                chunk.len(),
                CHUNK_SIZE
            )));
        }

        self.history.append_chunk(chunk)?;
        self.sample_index += CHUNK_SIZE as u64;
        let now_us = self.sample_index * 1_000_000 / SAMPLE_RATE as u64;
        let now_ms = now_us / 1000;

        self.spectral
            .process_chunk(&self.history, &self.window, now_ms);
        self.vu.process_chunk(&self.history);
        self.chroma.update(self.spectral.spectrogram_smooth());

        // The novelty log runs on its own 50 Hz deadline rather than the
        // chunk counter so the curve cadence survives a backend with a
        // different chunk size.
        if self.novelty.tick_due(now_us) {
            let flux = self.spectral.mean_positive_flux();
            let vu_peak = self.vu.drain_max();
            self.novelty.log(flux, vu_peak);
        }

        self.tempo.update_round_robin(&mut self.novelty, &self.window);
        self.tempo.update_phases(PHASE_DELTA_PER_CHUNK);

        let offset = self.chunk_in_hop * CHUNK_SIZE;
        self.hop_buffer[offset..offset + CHUNK_SIZE].copy_from_slice(chunk);
        self.chunk_in_hop += 1;
        if self.chunk_in_hop < CHUNKS_PER_HOP {
            return Ok(None);
        }
        self.chunk_in_hop = 0;

        Ok(Some(self.assemble_hop(now_us, now_ms)))
    }

    /// Fold the DSP state into one published frame. `now_us`/`now_ms` are
    /// the sample-derived clock at the end of the hop.
    fn assemble_hop(&mut self, now_us: u64, now_ms: u64) -> ControlBusFrame {
        let winner = self.tempo.top_bin_octave_aware();
        let bpm = self.tempo.bin_bpm(winner);
        let phase = self.tempo.bin(winner).phase;

        // Beat edge: the winning resonator's phase crossing zero from
        // below, debounced against double-fires when the winner hops
        // between neighboring bins.
        let mut tick = self.last_winner_phase < 0.0 && phase >= 0.0;
        self.last_winner_phase = phase;
        if tick {
            let beat_period_ms = 60_000.0 / bpm;
            let debounce_ms = (beat_period_ms * TICK_DEBOUNCE_RATIO) as u64;
            if now_ms.saturating_sub(self.last_tick_ms) < debounce_ms {
                tick = false;
            } else {
                self.last_tick_ms = now_ms;
            }
        }

        let raw = RawDspOutputs {
            vu_level: self.vu.level(),
            novelty_norm_last: self.novelty.normalized()[NOVELTY_HISTORY_LENGTH - 1],
            spectrogram_smooth: *self.spectral.spectrogram_smooth(),
            chromagram: *self.chroma.values(),
            tempo_bpm: bpm,
            tempo_confidence: self.tempo.confidence(),
            beat_tick: tick,
            beat_strength: self.tempo.bin(winner).magnitude,
            phase_radians: phase,
        };

        let waveform = downsample_hop(&self.hop_buffer);
        let input = self.adapter.build_input(&raw, &waveform);

        self.hop_seq = self.hop_seq.wrapping_add(1);
        let t = AudioTime::new(self.sample_index, SAMPLE_RATE, now_us);
        self.control.update_from_hop(t, self.hop_seq, &input)
    }

    pub fn set_mood_smoothing(&mut self, mood: u8) {
        self.control.set_mood_smoothing(mood);
    }

    pub fn set_silence_parameters(&mut self, threshold: f32, hysteresis_ms: f32) {
        self.control.set_silence_parameters(threshold, hysteresis_ms);
    }

    pub fn tempo(&self) -> &TempoEstimator {
        &self.tempo
    }

    pub fn novelty(&self) -> &NoveltyTracker {
        &self.novelty
    }

    pub fn vu(&self) -> &VuMeter {
        &self.vu
    }

    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// 2:1 peak-preserving downsample of a hop into signed scope points. Each
/// point keeps the sample with the larger magnitude, sign intact, so
/// transients survive the reduction.
fn downsample_hop(hop: &[f32; HOP_SIZE]) -> [i16; WAVEFORM_LENGTH] {
    const SAMPLES_PER_POINT: usize = HOP_SIZE / WAVEFORM_LENGTH;
    let mut points = [0i16; WAVEFORM_LENGTH];
    for (i, point) in points.iter_mut().enumerate() {
        let start = i * SAMPLES_PER_POINT;
        let mut peak = 0.0f32;
        let mut peak_sample = 0.0f32;
        for &sample in &hop[start..start + SAMPLES_PER_POINT] {
            if sample.abs() > peak {
                peak = sample.abs();
                peak_sample = sample;
            }
        }
        *point = (peak_sample * 32767.0) as i16;
    }
    points
}
