//! Stage B of frame assembly: derived control features on top of the
//! adapter output.
//!
//! Runs once per hop and owns every cross-hop envelope the published frame
//! carries: fast/slow loudness smoothing, single-frame spike removal with a
//! two-hop lookahead delay, per-zone AGC over bands and chroma, asymmetric
//! attack/release envelopes (plus the extra-slow "heavy" pair), triad
//! detection from the smoothed chromagram, the liveliness blend, and the
//! silence fade. Consumers only ever see the finished [`ControlBusFrame`].

use crate::audio::chroma::NUM_CHROMA;
use crate::audio::features::{
    AudioTime, ChordState, ChordType, ControlBusFrame, ControlBusInput, NUM_BANDS,
};
use crate::audio::spectral::NUM_FREQS;

/// Ring depth of the spike-removal lookahead; output is delayed by two hops.
pub const LOOKAHEAD_FRAMES: usize = 3;

/// AGC zones over both the 8 bands (2 each) and 12 chroma bins (3 each).
pub const NUM_ZONES: usize = 4;

/// Below this all-three-frames level, spike detection is skipped; random
/// noise wiggle would otherwise read as endless spikes.
const SPIKE_NOISE_FLOOR: f32 = 0.005;
const SPIKE_THRESHOLD_RATIO: f32 = 0.15;
const SPIKE_THRESHOLD_FLOOR: f32 = 0.02;

const LIVELINESS_TEMPO_WEIGHT: f32 = 0.6;
const LIVELINESS_FLUX_WEIGHT: f32 = 0.4;
const LIVELINESS_TAU_S: f32 = 0.30;

/// A clean triad holds ~0.4 of total chromagram energy; that ratio maps to
/// confidence 1.0.
const CHORD_ENERGY_RATIO: f32 = 0.4;
const CHORD_MIN_CONFIDENCE: f32 = 0.3;
const CHORD_MIN_TOTAL_ENERGY: f32 = 0.01;

const FALLBACK_DT_S: f32 = 0.016;

#[inline]
fn clip_unit(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Three-hop ring buffer that rewrites single-frame spikes before they
/// reach consumers.
///
/// The newest hop goes in, the oldest comes out (two hops late). When the
/// middle hop changes direction against both neighbors and deviates from
/// their average by more than 15% (floored at 0.02 absolute), it is
/// replaced by that average. The first three pushes output zeros while the
/// ring fills.
struct LookaheadBuffer<const N: usize> {
    history: [[f32; N]; LOOKAHEAD_FRAMES],
    cursor: usize,
    frames_filled: usize,
    enabled: bool,
}

impl<const N: usize> LookaheadBuffer<N> {
    fn new() -> Self {
        LookaheadBuffer {
            history: [[0.0; N]; LOOKAHEAD_FRAMES],
            cursor: 0,
            frames_filled: 0,
            enabled: true,
        }
    }

    fn push(&mut self, input: [f32; N]) -> [f32; N] {
        if !self.enabled {
            return input;
        }

        let newest = self.cursor;
        let middle = (self.cursor + LOOKAHEAD_FRAMES - 1) % LOOKAHEAD_FRAMES;
        let oldest = (self.cursor + LOOKAHEAD_FRAMES - 2) % LOOKAHEAD_FRAMES;

        self.history[newest] = input;

        if self.frames_filled < LOOKAHEAD_FRAMES {
            self.frames_filled += 1;
            self.cursor = (self.cursor + 1) % LOOKAHEAD_FRAMES;
            return [0.0; N];
        }

        for i in 0..N {
            let oldest_val = self.history[oldest][i];
            let middle_val = self.history[middle][i];
            let newest_val = self.history[newest][i];

            if oldest_val < SPIKE_NOISE_FLOOR
                && middle_val < SPIKE_NOISE_FLOOR
                && newest_val < SPIKE_NOISE_FLOOR
            {
                continue;
            }

            let rising_into = middle_val > oldest_val;
            let rising_out = newest_val > middle_val;
            if rising_into != rising_out {
                let expected = (oldest_val + newest_val) * 0.5;
                let deviation = (middle_val - expected).abs();
                let threshold = (expected * SPIKE_THRESHOLD_RATIO).max(SPIKE_THRESHOLD_FLOOR);
                if deviation > threshold {
                    self.history[middle][i] = expected;
                }
            }
        }

        let out = self.history[oldest];
        self.cursor = (self.cursor + 1) % LOOKAHEAD_FRAMES;
        out
    }
}

/// One AGC zone: a peak follower with symmetric attack/release and a floor
/// that caps the maximum gain at 100x.
struct ZoneAgc {
    follower: f32,
    attack: f32,
    release: f32,
    floor: f32,
}

impl ZoneAgc {
    fn new() -> Self {
        // Follower starts at 1.0 so the first loud hop is not over-amplified.
        ZoneAgc {
            follower: 1.0,
            attack: 0.05,
            release: 0.05,
            floor: 0.01,
        }
    }

    fn gain_for(&mut self, zone_max: f32) -> f32 {
        if zone_max > self.follower {
            self.follower += (zone_max - self.follower) * self.attack;
        } else {
            self.follower -= (self.follower - zone_max) * self.release;
        }
        if self.follower < self.floor {
            self.follower = self.floor;
        }
        1.0 / self.follower
    }
}

/// All Stage-B state. One instance per pipeline, fed strictly in hop order.
pub struct ControlStage {
    rms_s: f32,
    flux_s: f32,
    liveliness_s: f32,
    last_time: AudioTime,
    time_valid: bool,

    bands_s: [f32; NUM_BANDS],
    heavy_bands_s: [f32; NUM_BANDS],
    chroma_s: [f32; NUM_CHROMA],
    heavy_chroma_s: [f32; NUM_CHROMA],

    lookahead_bands: LookaheadBuffer<NUM_BANDS>,
    lookahead_chroma: LookaheadBuffer<NUM_CHROMA>,
    zones: [ZoneAgc; NUM_ZONES],
    chroma_zones: [ZoneAgc; NUM_ZONES],
    zone_agc_enabled: bool,
    chroma_zone_agc_enabled: bool,
    chord_detection_enabled: bool,

    alpha_fast: f32,
    alpha_slow: f32,
    band_attack: f32,
    band_release: f32,
    heavy_band_attack: f32,
    heavy_band_release: f32,

    silence_threshold: f32,
    silence_hysteresis_ms: f32,
    silence_start_ms: Option<u64>,
    silence_triggered: bool,
    silent_scale_s: f32,
}

impl ControlStage {
    pub fn new() -> Self {
        let mut stage = ControlStage {
            rms_s: 0.0,
            flux_s: 0.0,
            liveliness_s: 0.0,
            last_time: AudioTime::default(),
            time_valid: false,
            bands_s: [0.0; NUM_BANDS],
            heavy_bands_s: [0.0; NUM_BANDS],
            chroma_s: [0.0; NUM_CHROMA],
            heavy_chroma_s: [0.0; NUM_CHROMA],
            lookahead_bands: LookaheadBuffer::new(),
            lookahead_chroma: LookaheadBuffer::new(),
            zones: [ZoneAgc::new(), ZoneAgc::new(), ZoneAgc::new(), ZoneAgc::new()],
            chroma_zones: [ZoneAgc::new(), ZoneAgc::new(), ZoneAgc::new(), ZoneAgc::new()],
            zone_agc_enabled: true,
            chroma_zone_agc_enabled: true,
            chord_detection_enabled: true,
            alpha_fast: 0.35,
            alpha_slow: 0.12,
            band_attack: 0.15,
            band_release: 0.03,
            heavy_band_attack: 0.08,
            heavy_band_release: 0.015,
            silence_threshold: 0.01,
            silence_hysteresis_ms: 5000.0,
            silence_start_ms: None,
            silence_triggered: false,
            silent_scale_s: 1.0,
        };
        stage.set_mood_smoothing(128);
        stage
    }

    /// Map the mood knob (0..=255) onto every smoothing constant at once.
    /// Low mood is reactive (fast attack, slow decay), high mood is dreamy
    /// (slow attack, faster decay, more averaging).
    pub fn set_mood_smoothing(&mut self, mood: u8) {
        let m = f32::from(mood) / 255.0;
        self.alpha_fast = 0.25 + 0.20 * m;
        self.alpha_slow = 0.08 + 0.10 * m;
        self.band_attack = 0.25 - 0.17 * m;
        self.band_release = 0.02 + 0.04 * m;
        self.heavy_band_attack = 0.12 - 0.08 * m;
        self.heavy_band_release = 0.01 + 0.02 * m;
    }

    /// Silence fade tuning. A hysteresis of 0 disables the fade entirely;
    /// the threshold compares against the ungated band mean, not the
    /// heavily amplified VU path.
    pub fn set_silence_parameters(&mut self, threshold: f32, hysteresis_ms: f32) {
        self.silence_threshold = threshold;
        self.silence_hysteresis_ms = hysteresis_ms;
    }

    pub fn set_zone_agc_enabled(&mut self, enabled: bool) {
        self.zone_agc_enabled = enabled;
        self.chroma_zone_agc_enabled = enabled;
    }

    pub fn set_spike_removal_enabled(&mut self, enabled: bool) {
        self.lookahead_bands.enabled = enabled;
        self.lookahead_chroma.enabled = enabled;
    }

    pub fn set_chord_detection_enabled(&mut self, enabled: bool) {
        self.chord_detection_enabled = enabled;
    }

    /// Build the published frame for one hop.
    pub fn update_from_hop(
        &mut self,
        now: AudioTime,
        hop_seq: u32,
        raw: &ControlBusInput,
    ) -> ControlBusFrame {
        let mut frame = ControlBusFrame::default();
        frame.t = now;
        frame.hop_seq = hop_seq;

        // Hop delta for the time-constant envelopes. A bad clock falls back
        // to a nominal frame time instead of poisoning the smoothers.
        let mut dt = FALLBACK_DT_S;
        let had_time = self.time_valid;
        if had_time {
            let dt_s = AudioTime::seconds_between(&self.last_time, &now);
            if dt_s > 0.0 && dt_s < 1.0 {
                dt = dt_s;
            }
        }
        self.last_time = now;
        self.time_valid = true;

        // Fast copies plus the slow envelopes consumers treat as "the" level.
        frame.fast_rms = clip_unit(raw.rms);
        self.rms_s = lerp(self.rms_s, frame.fast_rms, self.alpha_fast);
        frame.rms = self.rms_s;

        frame.fast_flux = clip_unit(raw.flux);
        self.flux_s = lerp(self.flux_s, frame.fast_flux, self.alpha_slow);
        frame.flux = self.flux_s;

        let mut clamped_bands = [0.0f32; NUM_BANDS];
        for (slot, &band) in clamped_bands.iter_mut().zip(raw.bands.iter()) {
            *slot = clip_unit(band);
        }
        let mut clamped_chroma = [0.0f32; NUM_CHROMA];
        for (slot, &bin) in clamped_chroma.iter_mut().zip(raw.chroma.iter()) {
            *slot = clip_unit(bin);
        }

        let bands_despiked = self.lookahead_bands.push(clamped_bands);
        let chroma_despiked = self.lookahead_chroma.push(clamped_chroma);

        // Zone AGC: each pair of bands normalizes against its own recent
        // peak so bass cannot wash out mid and treble detail.
        let mut normalized_bands = bands_despiked;
        if self.zone_agc_enabled {
            for (z, zone) in self.zones.iter_mut().enumerate() {
                let start = z * 2;
                let zone_max = bands_despiked[start].max(bands_despiked[start + 1]);
                let gain = zone.gain_for(zone_max);
                for i in start..start + 2 {
                    normalized_bands[i] = clip_unit(bands_despiked[i] * gain);
                }
            }
        }

        for i in 0..NUM_BANDS {
            let target = normalized_bands[i];
            let alpha = if target > self.bands_s[i] {
                self.band_attack
            } else {
                self.band_release
            };
            self.bands_s[i] = lerp(self.bands_s[i], target, alpha);
            frame.bands[i] = self.bands_s[i];

            let heavy_alpha = if target > self.heavy_bands_s[i] {
                self.heavy_band_attack
            } else {
                self.heavy_band_release
            };
            self.heavy_bands_s[i] = lerp(self.heavy_bands_s[i], target, heavy_alpha);
            frame.heavy_bands[i] = self.heavy_bands_s[i];
        }

        // Chroma zones span three pitch classes each.
        let mut normalized_chroma = chroma_despiked;
        if self.chroma_zone_agc_enabled {
            for (z, zone) in self.chroma_zones.iter_mut().enumerate() {
                let start = z * 3;
                let zone_max = chroma_despiked[start]
                    .max(chroma_despiked[start + 1])
                    .max(chroma_despiked[start + 2]);
                let gain = zone.gain_for(zone_max);
                for i in start..start + 3 {
                    normalized_chroma[i] = clip_unit(chroma_despiked[i] * gain);
                }
            }
        }

        for i in 0..NUM_CHROMA {
            let target = normalized_chroma[i];
            let alpha = if target > self.chroma_s[i] {
                self.band_attack
            } else {
                self.band_release
            };
            self.chroma_s[i] = lerp(self.chroma_s[i], target, alpha);
            frame.chroma[i] = self.chroma_s[i];

            let heavy_alpha = if target > self.heavy_chroma_s[i] {
                self.heavy_band_attack
            } else {
                self.heavy_band_release
            };
            self.heavy_chroma_s[i] = lerp(self.heavy_chroma_s[i], target, heavy_alpha);
            frame.heavy_chroma[i] = self.heavy_chroma_s[i];
        }

        if self.chord_detection_enabled {
            frame.chord = detect_chord(&frame.chroma);
        }

        frame.vu_level = raw.vu_level;
        frame.tempo_bpm = raw.tempo_bpm;
        frame.tempo_confidence = raw.tempo_confidence;
        frame.tempo_locked = raw.tempo_locked;
        frame.beat_tick = raw.beat_tick;
        frame.beat_strength = raw.beat_strength;
        frame.beat_phase01 = raw.beat_phase01;
        frame.beat_in_bar = raw.beat_in_bar;
        frame.downbeat_tick = raw.downbeat_tick;

        // Liveliness: how much the music is "going somewhere" right now.
        // Snaps on the first hop, then follows with tau 0.30 s.
        let tempo_conf = clip_unit(frame.tempo_confidence);
        let flux_now = clip_unit(frame.fast_flux);
        let raw_liveliness =
            clip_unit(tempo_conf * LIVELINESS_TEMPO_WEIGHT + flux_now * LIVELINESS_FLUX_WEIGHT);
        let alpha = 1.0 - (-dt / LIVELINESS_TAU_S).exp();
        if !had_time {
            self.liveliness_s = raw_liveliness;
        } else {
            self.liveliness_s = lerp(self.liveliness_s, raw_liveliness, alpha);
        }
        frame.liveliness = clip_unit(self.liveliness_s);

        frame.waveform = raw.waveform;
        frame.waveform_peak_scaled = raw.waveform_peak_scaled;
        frame.waveform_peak_scaled_last = raw.waveform_peak_scaled_last;
        frame.note_chroma = raw.note_chroma;
        frame.note_chroma_max = raw.note_chroma_max;

        frame.snare_energy = clip_unit(raw.snare_energy);
        frame.hihat_energy = clip_unit(raw.hihat_energy);
        frame.snare_trigger = raw.snare_trigger;
        frame.hihat_trigger = raw.hihat_trigger;

        for i in 0..NUM_FREQS {
            frame.bins64[i] = clip_unit(raw.bins64[i]);
            frame.bins64_adaptive[i] = clip_unit(raw.bins64_adaptive[i]);
        }

        self.apply_silence_fade(&mut frame, now, raw);

        frame
    }

    /// Sensory-style silence fade: the ungated level must stay under the
    /// threshold for the whole hysteresis window before the fade starts,
    /// and any audio snaps the state machine back immediately.
    fn apply_silence_fade(
        &mut self,
        frame: &mut ControlBusFrame,
        now: AudioTime,
        raw: &ControlBusInput,
    ) {
        if self.silence_hysteresis_ms <= 0.0 {
            frame.silent_scale = 1.0;
            frame.is_silent = false;
            return;
        }

        let now_ms = now.monotonic_us / 1000;
        let currently_silent = clip_unit(raw.rms_ungated) < self.silence_threshold;

        if currently_silent && !self.silence_triggered {
            let started = *self.silence_start_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(started) >= self.silence_hysteresis_ms as u64 {
                self.silence_triggered = true;
            }
        } else if !currently_silent {
            self.silence_start_ms = None;
            self.silence_triggered = false;
        }

        let target = if self.silence_triggered { 0.0 } else { 1.0 };
        self.silent_scale_s = target * 0.1 + self.silent_scale_s * 0.9;

        frame.silent_scale = self.silent_scale_s;
        frame.is_silent = self.silence_triggered;
    }
}

impl Default for ControlStage {
    fn default() -> Self {
        ControlStage::new()
    }
}

/// Classify the strongest triad in a smoothed chromagram.
///
/// Root is the loudest pitch class; the third picks minor (+3) or major
/// (+4) by strength, the fifth picks perfect (+7), diminished (+6) or
/// augmented (+8). Confidence is the triad's share of total energy, scaled
/// so a clean triad reads 1.0, and anything under 0.3 degrades to no chord.
pub fn detect_chord(chroma: &[f32; NUM_CHROMA]) -> ChordState {
    let mut state = ChordState::default();

    let mut root = 0usize;
    let mut root_val = chroma[0];
    let mut total_energy = chroma[0];
    for (i, &energy) in chroma.iter().enumerate().skip(1) {
        total_energy += energy;
        if energy > root_val {
            root_val = energy;
            root = i;
        }
    }
    state.root_note = root as u8;
    state.root_strength = root_val;

    let minor_third = chroma[(root + 3) % NUM_CHROMA];
    let major_third = chroma[(root + 4) % NUM_CHROMA];
    let perfect_fifth = chroma[(root + 7) % NUM_CHROMA];
    let dim_fifth = chroma[(root + 6) % NUM_CHROMA];
    let aug_fifth = chroma[(root + 8) % NUM_CHROMA];

    let has_minor_third = minor_third > major_third;
    state.third_strength = if has_minor_third {
        minor_third
    } else {
        major_third
    };

    if perfect_fifth >= dim_fifth && perfect_fifth >= aug_fifth {
        state.fifth_strength = perfect_fifth;
        state.kind = if has_minor_third {
            ChordType::Minor
        } else {
            ChordType::Major
        };
    } else if dim_fifth > perfect_fifth && dim_fifth > aug_fifth {
        state.fifth_strength = dim_fifth;
        state.kind = ChordType::Diminished;
    } else {
        state.fifth_strength = aug_fifth;
        state.kind = ChordType::Augmented;
    }

    let triad_energy = state.root_strength + state.third_strength + state.fifth_strength;
    if total_energy > CHORD_MIN_TOTAL_ENERGY {
        state.confidence = clip_unit((triad_energy / total_energy) / CHORD_ENERGY_RATIO);
    } else {
        state.confidence = 0.0;
        state.kind = ChordType::None;
    }
    if state.confidence < CHORD_MIN_CONFIDENCE {
        state.kind = ChordType::None;
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::spectral::SAMPLE_RATE;

    fn hop_time(hop: u64) -> AudioTime {
        let samples = hop * 256;
        AudioTime::new(samples, SAMPLE_RATE, hop * 20_000)
    }

    fn active_input() -> ControlBusInput {
        ControlBusInput {
            rms_ungated: 0.2,
            ..ControlBusInput::default()
        }
    }

    #[test]
    fn lookahead_flattens_an_isolated_spike() {
        let mut buffer: LookaheadBuffer<1> = LookaheadBuffer::new();
        let sequence = [0.2, 0.2, 0.2, 0.9, 0.2, 0.2, 0.2, 0.2];
        let mut outputs = Vec::new();
        for v in sequence {
            outputs.push(buffer.push([v])[0]);
        }
        assert!(
            outputs.iter().all(|&v| v < 0.6),
            "spike should never surface, got {outputs:?}"
        );
    }

    #[test]
    fn lookahead_passes_a_steady_ramp_delayed() {
        let mut buffer: LookaheadBuffer<1> = LookaheadBuffer::new();
        let ramp = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let mut outputs = Vec::new();
        for v in ramp {
            outputs.push(buffer.push([v])[0]);
        }
        // Three warmup zeros, then the ramp emerges two frames late.
        assert_eq!(&outputs[..3], &[0.0, 0.0, 0.0]);
        assert!((outputs[3] - 0.2).abs() < 1e-6);
        assert!((outputs[4] - 0.3).abs() < 1e-6);
        assert!((outputs[5] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn zone_agc_lifts_quiet_zones_independently() {
        let mut stage = ControlStage::new();
        let mut raw = active_input();
        raw.bands = [0.8, 0.8, 0.02, 0.02, 0.0, 0.0, 0.0, 0.0];
        let mut frame = ControlBusFrame::default();
        for hop in 0..300 {
            frame = stage.update_from_hop(hop_time(hop), hop as u32, &raw);
        }
        assert!(frame.bands[0] > 0.9, "loud zone at {}", frame.bands[0]);
        assert!(
            frame.bands[2] > 0.5,
            "quiet zone should be lifted by its own gain, got {}",
            frame.bands[2]
        );
    }

    #[test]
    fn heavy_bands_lag_the_normal_envelope() {
        let mut stage = ControlStage::new();
        let mut raw = active_input();
        raw.bands = [0.9; NUM_BANDS];
        let mut frame = ControlBusFrame::default();
        for hop in 0..10 {
            frame = stage.update_from_hop(hop_time(hop), hop as u32, &raw);
        }
        assert!(frame.bands[0] > frame.heavy_bands[0]);
        assert!(frame.heavy_bands[0] > 0.0);
    }

    #[test]
    fn major_and_minor_triads_classify() {
        let mut chroma = [0.0f32; NUM_CHROMA];
        chroma[0] = 0.9;
        chroma[4] = 0.7;
        chroma[7] = 0.8;
        let major = detect_chord(&chroma);
        assert_eq!(major.kind, ChordType::Major);
        assert_eq!(major.root_note, 0);
        assert!(major.confidence > 0.9);

        let mut chroma = [0.0f32; NUM_CHROMA];
        chroma[2] = 0.9;
        chroma[5] = 0.7; // +3
        chroma[9] = 0.8; // +7
        let minor = detect_chord(&chroma);
        assert_eq!(minor.kind, ChordType::Minor);
        assert_eq!(minor.root_note, 2);
    }

    #[test]
    fn diminished_and_augmented_triads_classify() {
        let mut chroma = [0.0f32; NUM_CHROMA];
        chroma[0] = 0.9;
        chroma[3] = 0.7; // minor third
        chroma[6] = 0.8; // tritone
        assert_eq!(detect_chord(&chroma).kind, ChordType::Diminished);

        let mut chroma = [0.0f32; NUM_CHROMA];
        chroma[0] = 0.9;
        chroma[4] = 0.7; // major third
        chroma[8] = 0.8; // augmented fifth
        assert_eq!(detect_chord(&chroma).kind, ChordType::Augmented);
    }

    #[test]
    fn empty_chromagram_reads_as_no_chord() {
        let chroma = [0.0f32; NUM_CHROMA];
        let state = detect_chord(&chroma);
        assert_eq!(state.kind, ChordType::None);
        assert_eq!(state.confidence, 0.0);
    }

    #[test]
    fn silence_fades_only_after_the_hysteresis_window() {
        let mut stage = ControlStage::new();
        stage.set_silence_parameters(0.01, 100.0);
        let silent = ControlBusInput::default();

        // 4 hops * 20 ms = 80 ms of silence: inside the window, still active.
        let mut frame = ControlBusFrame::default();
        for hop in 0..5 {
            frame = stage.update_from_hop(hop_time(hop), hop as u32, &silent);
        }
        assert!(!frame.is_silent);

        for hop in 5..20 {
            frame = stage.update_from_hop(hop_time(hop), hop as u32, &silent);
        }
        assert!(frame.is_silent);
        assert!(frame.silent_scale < 0.5);

        // Audio returns: state machine resets immediately, scale recovers.
        let loud = active_input();
        frame = stage.update_from_hop(hop_time(20), 20, &loud);
        assert!(!frame.is_silent);
        for hop in 21..60 {
            frame = stage.update_from_hop(hop_time(hop), hop as u32, &loud);
        }
        assert!(frame.silent_scale > 0.9);
    }

    #[test]
    fn liveliness_snaps_then_follows_slowly() {
        let mut stage = ControlStage::new();
        let mut raw = active_input();
        raw.tempo_confidence = 0.5;
        raw.flux = 0.5;
        let first = stage.update_from_hop(hop_time(0), 0, &raw);
        assert!((first.liveliness - 0.5).abs() < 1e-6);

        raw.tempo_confidence = 0.0;
        raw.flux = 0.0;
        let second = stage.update_from_hop(hop_time(1), 1, &raw);
        assert!(second.liveliness > 0.46 && second.liveliness < 0.47);
    }
}
