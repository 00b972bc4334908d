//! Stage A of frame assembly: raw DSP magnitudes into a normalized
//! [`ControlBusInput`].
//!
//! The DSP stages autorange against their own noise floors but still leave
//! absolute levels at the mercy of the capture gain. The adapter runs
//! max-followers over the spectrum and chromagram so downstream consumers
//! see a usable 0..1 signal regardless of input sensitivity, aggregates the
//! 8 bands, scales the scope waveform against its sweet-spot follower, and
//! gates the percussive onset triggers. Smoothing constants are tuned for
//! the 50 Hz hop cadence.

use crate::audio::chroma::NUM_CHROMA;
use crate::audio::features::{ControlBusInput, NUM_BANDS, WAVEFORM_LENGTH};
use crate::audio::spectral::NUM_FREQS;

#[inline]
fn clip_unit(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

/// Confidence above which the tempo estimate counts as locked.
pub const TEMPO_LOCK_THRESHOLD: f32 = 0.5;

/// VU level below which autorange gain is frozen at unity.
const ACTIVE_VU_THRESHOLD: f32 = 0.01;

const BINS_FOLLOWER_DECAY: f32 = 0.995;
const BINS_FOLLOWER_RISE: f32 = 0.25;
const BINS_FOLLOWER_FLOOR: f32 = 0.05;

const CHROMA_FOLLOWER_RISE: f32 = 0.35;
const CHROMA_FOLLOWER_FLOOR: f32 = 0.08;

/// Waveform peaks below this count as the noise floor of the capture path;
/// the follower never drops under it.
const WAVEFORM_SWEET_SPOT: f32 = 750.0;
const WAVEFORM_PEAK_ATTACK: f32 = 0.25;
const WAVEFORM_PEAK_RELEASE: f32 = 0.005;
const WAVEFORM_SCALED_RATE: f32 = 0.25;
const WAVEFORM_LAST_ALPHA: f32 = 0.05;

const ONSET_THRESHOLD: f32 = 0.08;
const SNARE_GATE: f32 = 0.10;
const HIHAT_GATE: f32 = 0.05;
const SNARE_BINS: std::ops::RangeInclusive<usize> = 5..=10;
const HIHAT_BINS: std::ops::RangeInclusive<usize> = 50..=60;

/// Everything the DSP stages hand over at hop time.
#[derive(Clone, Copy, Debug)]
pub struct RawDspOutputs {
    pub vu_level: f32,
    pub novelty_norm_last: f32,
    pub spectrogram_smooth: [f32; NUM_FREQS],
    pub chromagram: [f32; NUM_CHROMA],
    pub tempo_bpm: f32,
    pub tempo_confidence: f32,
    pub beat_tick: bool,
    pub beat_strength: f32,
    pub phase_radians: f32,
}

impl Default for RawDspOutputs {
    fn default() -> Self {
        RawDspOutputs {
            vu_level: 0.0,
            novelty_norm_last: 0.0,
            spectrogram_smooth: [0.0; NUM_FREQS],
            chromagram: [0.0; NUM_CHROMA],
            tempo_bpm: 0.0,
            tempo_confidence: 0.0,
            beat_tick: false,
            beat_strength: 0.0,
            phase_radians: 0.0,
        }
    }
}

/// Cross-hop adapter state: autorange followers and the beat-in-bar counter.
pub struct BackendAdapter {
    bins_max_follower: f32,
    chroma_max_follower: f32,
    waveform_follower: f32,
    waveform_peak_scaled: f32,
    waveform_peak_scaled_last: f32,
    prev_snare_energy: f32,
    prev_hihat_energy: f32,
    beat_in_bar: u8,
}

impl BackendAdapter {
    pub fn new() -> Self {
        BackendAdapter {
            bins_max_follower: 0.1,
            chroma_max_follower: 0.2,
            waveform_follower: WAVEFORM_SWEET_SPOT,
            waveform_peak_scaled: 0.0,
            waveform_peak_scaled_last: 0.0,
            prev_snare_energy: 0.0,
            prev_hihat_energy: 0.0,
            beat_in_bar: 0,
        }
    }

    /// Assemble one hop of stage-A output. `waveform` carries the hop's
    /// centered scope samples, already peak-picked to 128 points.
    pub fn build_input(
        &mut self,
        raw: &RawDspOutputs,
        waveform: &[i16; WAVEFORM_LENGTH],
    ) -> ControlBusInput {
        let mut out = ControlBusInput::default();

        out.rms = clip_unit((raw.vu_level.max(0.0)).sqrt() * 1.25);
        out.flux = clip_unit(raw.novelty_norm_last);
        out.vu_level = clip_unit(raw.vu_level);

        let is_active = raw.vu_level >= ACTIVE_VU_THRESHOLD;

        // Spectrum autorange. The follower decays every hop and only rises
        // partway toward a louder peak, so one transient cannot crush the
        // whole spectrum's gain.
        let mut raw_bins = [0.0f32; NUM_FREQS];
        let mut current_max = 0.00001f32;
        for (slot, &magnitude) in raw_bins.iter_mut().zip(raw.spectrogram_smooth.iter()) {
            *slot = clip_unit(magnitude);
            current_max = current_max.max(*slot);
        }
        let decayed = self.bins_max_follower * BINS_FOLLOWER_DECAY;
        self.bins_max_follower = if current_max > decayed {
            decayed + (current_max - decayed) * BINS_FOLLOWER_RISE
        } else {
            decayed
        };
        if self.bins_max_follower < BINS_FOLLOWER_FLOOR {
            self.bins_max_follower = BINS_FOLLOWER_FLOOR;
        }

        let inv = if is_active {
            1.0 / self.bins_max_follower
        } else {
            1.0
        };
        for i in 0..NUM_FREQS {
            let v = clip_unit(raw_bins[i] * inv);
            out.bins64[i] = v;
            out.bins64_adaptive[i] = v;
        }

        // 8 bands, mean of each 8-bin block: 0 = sub-bass rising to 7 = air.
        for band in 0..NUM_BANDS {
            let start = band * 8;
            let sum: f32 = out.bins64[start..start + 8].iter().sum();
            out.bands[band] = clip_unit(sum / 8.0);
        }
        out.rms_ungated = clip_unit(out.bands.iter().sum::<f32>() / NUM_BANDS as f32);

        // Chroma autorange, same follower shape with its own rise and floor.
        let mut raw_chroma = [0.0f32; NUM_CHROMA];
        let mut chroma_max = 0.00001f32;
        for (slot, &magnitude) in raw_chroma.iter_mut().zip(raw.chromagram.iter()) {
            *slot = clip_unit(magnitude);
            chroma_max = chroma_max.max(*slot);
        }
        let chroma_decayed = self.chroma_max_follower * BINS_FOLLOWER_DECAY;
        self.chroma_max_follower = if chroma_max > chroma_decayed {
            chroma_decayed + (chroma_max - chroma_decayed) * CHROMA_FOLLOWER_RISE
        } else {
            chroma_decayed
        };
        if self.chroma_max_follower < CHROMA_FOLLOWER_FLOOR {
            self.chroma_max_follower = CHROMA_FOLLOWER_FLOOR;
        }
        let chroma_inv = if is_active {
            1.0 / self.chroma_max_follower
        } else {
            1.0
        };
        for i in 0..NUM_CHROMA {
            out.chroma[i] = clip_unit(raw_chroma[i] * chroma_inv);
        }

        out.waveform = *waveform;
        self.scale_waveform(waveform, &mut out);
        self.fold_note_chroma(&mut out);
        self.detect_onsets(&mut out);

        out.tempo_bpm = raw.tempo_bpm;
        out.tempo_confidence = clip_unit(raw.tempo_confidence);
        out.tempo_locked = out.tempo_confidence > TEMPO_LOCK_THRESHOLD;
        out.beat_tick = raw.beat_tick && out.tempo_locked;
        out.beat_strength = clip_unit(raw.beat_strength);

        // Phase in radians [-pi, pi] to wrapped [0, 1).
        let mut phase01 =
            (raw.phase_radians + std::f32::consts::PI) / (2.0 * std::f32::consts::PI);
        phase01 -= phase01.floor();
        out.beat_phase01 = clip_unit(phase01);

        if out.beat_tick {
            self.beat_in_bar = (self.beat_in_bar + 1) % 4;
        }
        out.beat_in_bar = self.beat_in_bar;
        out.downbeat_tick = out.beat_tick && self.beat_in_bar == 0;

        out
    }

    /// Sweet-spot peak scaling: fast attack toward louder peaks, very slow
    /// release back down, never below the capture noise floor.
    fn scale_waveform(&mut self, waveform: &[i16; WAVEFORM_LENGTH], out: &mut ControlBusInput) {
        let mut peak = 0.0f32;
        for &sample in waveform.iter() {
            let magnitude = (sample as i32).unsigned_abs() as f32;
            if magnitude > peak {
                peak = magnitude;
            }
        }
        let over_floor = (peak - WAVEFORM_SWEET_SPOT).max(0.0);

        if over_floor > self.waveform_follower {
            let delta = over_floor - self.waveform_follower;
            self.waveform_follower += delta * WAVEFORM_PEAK_ATTACK;
        } else if over_floor < self.waveform_follower {
            let delta = self.waveform_follower - over_floor;
            self.waveform_follower -= delta * WAVEFORM_PEAK_RELEASE;
            if self.waveform_follower < WAVEFORM_SWEET_SPOT {
                self.waveform_follower = WAVEFORM_SWEET_SPOT;
            }
        }

        let scaled_raw = if self.waveform_follower > 0.0 {
            over_floor / self.waveform_follower
        } else {
            0.0
        };
        if scaled_raw > self.waveform_peak_scaled {
            let delta = scaled_raw - self.waveform_peak_scaled;
            self.waveform_peak_scaled += delta * WAVEFORM_SCALED_RATE;
        } else if scaled_raw < self.waveform_peak_scaled {
            let delta = self.waveform_peak_scaled - scaled_raw;
            self.waveform_peak_scaled -= delta * WAVEFORM_SCALED_RATE;
        }
        self.waveform_peak_scaled_last = self.waveform_peak_scaled * WAVEFORM_LAST_ALPHA
            + self.waveform_peak_scaled_last * (1.0 - WAVEFORM_LAST_ALPHA);

        out.waveform_peak_scaled = self.waveform_peak_scaled;
        out.waveform_peak_scaled_last = self.waveform_peak_scaled_last;
    }

    /// Fold the adaptive spectrum into a 12-note chromagram: six octaves of
    /// note offsets, each sum saturating at 1.0.
    fn fold_note_chroma(&mut self, out: &mut ControlBusInput) {
        let mut note_chroma = [0.0f32; NUM_CHROMA];
        let mut max_val = 0.0f32;
        for octave in 0..6 {
            for note in 0..NUM_CHROMA {
                let bin = 12 * octave + note;
                if bin < NUM_FREQS {
                    note_chroma[note] = (note_chroma[note] + out.bins64_adaptive[bin]).min(1.0);
                    max_val = max_val.max(note_chroma[note]);
                }
            }
        }
        out.note_chroma = note_chroma;
        out.note_chroma_max = max_val.max(0.0001);
    }

    /// Percussive onsets from fixed spectrum regions. One-hop pulses: an
    /// onset fires when the region's energy jumps past the previous hop by
    /// the threshold and clears its absolute gate.
    fn detect_onsets(&mut self, out: &mut ControlBusInput) {
        let snare_sum: f32 = out.bins64[SNARE_BINS].iter().sum();
        out.snare_energy = clip_unit(snare_sum / 6.0);
        let hihat_sum: f32 = out.bins64[HIHAT_BINS].iter().sum();
        out.hihat_energy = clip_unit(hihat_sum / 11.0);

        out.snare_trigger = out.snare_energy > self.prev_snare_energy + ONSET_THRESHOLD
            && out.snare_energy > SNARE_GATE;
        out.hihat_trigger = out.hihat_energy > self.prev_hihat_energy + ONSET_THRESHOLD
            && out.hihat_energy > HIHAT_GATE;

        self.prev_snare_energy = out.snare_energy;
        self.prev_hihat_energy = out.hihat_energy;
    }
}

impl Default for BackendAdapter {
    fn default() -> Self {
        BackendAdapter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_raw() -> RawDspOutputs {
        RawDspOutputs {
            vu_level: 0.2,
            ..RawDspOutputs::default()
        }
    }

    #[test]
    fn follower_normalizes_a_quiet_spectrum() {
        let mut adapter = BackendAdapter::new();
        let mut raw = quiet_raw();
        raw.spectrogram_smooth[20] = 0.2;
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let mut out = adapter.build_input(&raw, &silent_wave);
        for _ in 0..200 {
            out = adapter.build_input(&raw, &silent_wave);
        }
        assert!(
            out.bins64[20] > 0.9,
            "peak bin should be pulled toward full scale, got {}",
            out.bins64[20]
        );
        assert!(out.bins64[0] < 0.05);
    }

    #[test]
    fn inactive_input_freezes_the_gain() {
        let mut adapter = BackendAdapter::new();
        let mut raw = RawDspOutputs {
            vu_level: 0.001,
            ..RawDspOutputs::default()
        };
        raw.spectrogram_smooth[5] = 0.3;
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let out = adapter.build_input(&raw, &silent_wave);
        assert!((out.bins64[5] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn bands_average_their_bin_blocks() {
        let mut adapter = BackendAdapter::new();
        let mut raw = RawDspOutputs {
            vu_level: 0.001,
            ..RawDspOutputs::default()
        };
        for i in 8..16 {
            raw.spectrogram_smooth[i] = 0.4;
        }
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let out = adapter.build_input(&raw, &silent_wave);
        assert!((out.bands[1] - 0.4).abs() < 1e-6);
        assert_eq!(out.bands[0], 0.0);
        assert!((out.rms_ungated - 0.05).abs() < 1e-6);
    }

    #[test]
    fn onset_fires_once_per_rise() {
        let mut adapter = BackendAdapter::new();
        let mut raw = quiet_raw();
        for i in 5..=10 {
            raw.spectrogram_smooth[i] = 0.8;
        }
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let first = adapter.build_input(&raw, &silent_wave);
        assert!(first.snare_trigger, "rising edge should trigger");
        let second = adapter.build_input(&raw, &silent_wave);
        assert!(!second.snare_trigger, "steady energy must not retrigger");
    }

    #[test]
    fn beat_in_bar_wraps_with_a_downbeat() {
        let mut adapter = BackendAdapter::new();
        let raw_tick = RawDspOutputs {
            vu_level: 0.2,
            tempo_confidence: 0.8,
            beat_tick: true,
            ..RawDspOutputs::default()
        };
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let mut downbeats = 0;
        let mut bars = Vec::new();
        for _ in 0..8 {
            let out = adapter.build_input(&raw_tick, &silent_wave);
            bars.push(out.beat_in_bar);
            if out.downbeat_tick {
                downbeats += 1;
            }
        }
        assert_eq!(bars, vec![1, 2, 3, 0, 1, 2, 3, 0]);
        assert_eq!(downbeats, 2);
    }

    #[test]
    fn unlocked_confidence_suppresses_ticks() {
        let mut adapter = BackendAdapter::new();
        let raw = RawDspOutputs {
            vu_level: 0.2,
            tempo_confidence: 0.3,
            beat_tick: true,
            ..RawDspOutputs::default()
        };
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let out = adapter.build_input(&raw, &silent_wave);
        assert!(!out.tempo_locked);
        assert!(!out.beat_tick);
    }

    #[test]
    fn phase_maps_to_the_unit_interval() {
        let mut adapter = BackendAdapter::new();
        let silent_wave = [0i16; WAVEFORM_LENGTH];
        let mut raw = quiet_raw();
        raw.phase_radians = 0.0;
        let mid = adapter.build_input(&raw, &silent_wave);
        assert!((mid.beat_phase01 - 0.5).abs() < 1e-6);
        raw.phase_radians = std::f32::consts::PI;
        let wrapped = adapter.build_input(&raw, &silent_wave);
        assert!(wrapped.beat_phase01 < 1e-6);
    }

    #[test]
    fn waveform_follower_rides_loud_peaks_down_slowly() {
        let mut adapter = BackendAdapter::new();
        let raw = quiet_raw();
        let loud = [8000i16; WAVEFORM_LENGTH];
        let mut out = adapter.build_input(&raw, &loud);
        for _ in 0..80 {
            out = adapter.build_input(&raw, &loud);
        }
        assert!(out.waveform_peak_scaled > 0.9);

        let silent = [0i16; WAVEFORM_LENGTH];
        out = adapter.build_input(&raw, &silent);
        // Release is 50x slower than attack; one quiet hop barely moves it.
        assert!(out.waveform_peak_scaled < 0.9);
        let follower_after_one = adapter.waveform_follower;
        assert!(follower_after_one > 6000.0);
    }
}
