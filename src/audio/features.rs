//! Value types published by the audio pipeline.
//!
//! Everything here is plain `Copy` data: frames cross the producer/consumer
//! boundary by value through the snapshot buffer, never by reference. The
//! adapter fills a [`ControlBusInput`] once per hop; the control stage turns
//! it into the [`ControlBusFrame`] consumers actually read.

use crate::audio::chroma::NUM_CHROMA;
use crate::audio::spectral::NUM_FREQS;

/// Aggregated frequency bands carried on every frame.
pub const NUM_BANDS: usize = 8;

/// Oscilloscope points per hop (256 hop samples, peak-picked 2:1).
pub const WAVEFORM_LENGTH: usize = 128;

/// Position of a frame on the audio timeline.
///
/// `sample_index` counts samples consumed since the pipeline started and is
/// the authoritative clock; `monotonic_us` is the wall-clock stamp of the
/// moment the hop was built, used only for silence hysteresis and logging.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioTime {
    pub sample_index: u64,
    pub sample_rate_hz: u32,
    pub monotonic_us: u64,
}

impl AudioTime {
    pub fn new(sample_index: u64, sample_rate_hz: u32, monotonic_us: u64) -> Self {
        AudioTime {
            sample_index,
            sample_rate_hz,
            monotonic_us,
        }
    }

    /// Seconds from the start of the stream, in the sample domain.
    pub fn as_seconds(&self) -> f64 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.sample_index as f64 / self.sample_rate_hz as f64
    }

    /// Sample-domain seconds elapsed from `earlier` to `later`. Returns 0.0
    /// when the clocks run backwards or the rate is unset, so callers can
    /// fall back to a nominal dt instead of smoothing with garbage.
    pub fn seconds_between(earlier: &AudioTime, later: &AudioTime) -> f32 {
        if later.sample_rate_hz == 0 || later.sample_index < earlier.sample_index {
            return 0.0;
        }
        let delta = later.sample_index - earlier.sample_index;
        (delta as f64 / later.sample_rate_hz as f64) as f32
    }
}

/// Triad quality detected from the chromagram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChordType {
    #[default]
    None,
    Major,
    Minor,
    Diminished,
    Augmented,
}

impl ChordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChordType::None => "-",
            ChordType::Major => "maj",
            ChordType::Minor => "min",
            ChordType::Diminished => "dim",
            ChordType::Augmented => "aug",
        }
    }
}

/// Strongest triad in the current chromagram.
///
/// `root_note` indexes the chromagram, whose slot 0 folds the lowest
/// analyzed note (77.78 Hz, a D#); [`ChordState::root_name`] applies that
/// rotation when printing.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChordState {
    pub root_note: u8,
    pub kind: ChordType,
    /// Triad share of total chromagram energy, scaled so a clean triad
    /// (0.4 of total) reads 1.0.
    pub confidence: f32,
    pub root_strength: f32,
    pub third_strength: f32,
    pub fifth_strength: f32,
}

const PITCH_CLASS_NAMES: [&str; NUM_CHROMA] = [
    "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B", "C", "C#", "D",
];

impl ChordState {
    pub fn root_name(&self) -> &'static str {
        PITCH_CLASS_NAMES[self.root_note as usize % NUM_CHROMA]
    }
}

/// One hop of adapter output, before the control stage runs.
///
/// The adapter normalizes the raw DSP magnitudes here (autorange followers,
/// band aggregation, onset gates); the pipeline then bridges the tempo
/// fields and hands the whole thing to the control stage.
#[derive(Clone, Copy, Debug)]
pub struct ControlBusInput {
    /// Perceptually mapped loudness, `sqrt(vu)·1.25` clamped to [0,1].
    pub rms: f32,
    /// Last normalized novelty-curve value.
    pub flux: f32,
    /// Raw VU level before mapping, the activity/silence reference.
    pub vu_level: f32,
    /// Mean of the autoranged bands; feeds the silence gate instead of the
    /// heavily amplified VU path.
    pub rms_ungated: f32,

    pub bins64: [f32; NUM_FREQS],
    pub bins64_adaptive: [f32; NUM_FREQS],
    pub bands: [f32; NUM_BANDS],
    pub chroma: [f32; NUM_CHROMA],

    pub waveform: [i16; WAVEFORM_LENGTH],
    pub waveform_peak_scaled: f32,
    pub waveform_peak_scaled_last: f32,
    pub note_chroma: [f32; NUM_CHROMA],
    pub note_chroma_max: f32,

    pub snare_energy: f32,
    pub hihat_energy: f32,
    pub snare_trigger: bool,
    pub hihat_trigger: bool,

    pub tempo_bpm: f32,
    pub tempo_confidence: f32,
    pub tempo_locked: bool,
    /// Winner-phase zero crossing, already gated by `tempo_locked`.
    pub beat_tick: bool,
    pub beat_strength: f32,
    pub beat_phase01: f32,
    pub beat_in_bar: u8,
    pub downbeat_tick: bool,
}

impl Default for ControlBusInput {
    fn default() -> Self {
        ControlBusInput {
            rms: 0.0,
            flux: 0.0,
            vu_level: 0.0,
            rms_ungated: 0.0,
            bins64: [0.0; NUM_FREQS],
            bins64_adaptive: [0.0; NUM_FREQS],
            bands: [0.0; NUM_BANDS],
            chroma: [0.0; NUM_CHROMA],
            waveform: [0; WAVEFORM_LENGTH],
            waveform_peak_scaled: 0.0,
            waveform_peak_scaled_last: 0.0,
            note_chroma: [0.0; NUM_CHROMA],
            note_chroma_max: 0.0001,
            snare_energy: 0.0,
            hihat_energy: 0.0,
            snare_trigger: false,
            hihat_trigger: false,
            tempo_bpm: 0.0,
            tempo_confidence: 0.0,
            tempo_locked: false,
            beat_tick: false,
            beat_strength: 0.0,
            beat_phase01: 0.0,
            beat_in_bar: 0,
            downbeat_tick: false,
        }
    }
}

/// The per-hop contract between the audio pipeline and every consumer.
///
/// All magnitudes are autoranged to [0,1]; the waveform stays in centered
/// i16 so scope-style consumers get signed peaks. Published by value through
/// the snapshot buffer once per hop (50 Hz at the native rate).
#[derive(Clone, Copy, Debug)]
pub struct ControlBusFrame {
    pub t: AudioTime,
    pub hop_seq: u32,

    /// Slow-smoothed loudness envelope.
    pub rms: f32,
    /// Slow-smoothed spectral flux.
    pub flux: f32,
    /// Same signals without the slow smoothing.
    pub fast_rms: f32,
    pub fast_flux: f32,
    pub vu_level: f32,

    /// Despiked, zone-normalized, asymmetrically smoothed bands.
    pub bands: [f32; NUM_BANDS],
    /// Extra-slow envelope of the same bands for ambient consumers.
    pub heavy_bands: [f32; NUM_BANDS],
    pub chroma: [f32; NUM_CHROMA],
    pub heavy_chroma: [f32; NUM_CHROMA],

    pub bins64: [f32; NUM_FREQS],
    pub bins64_adaptive: [f32; NUM_FREQS],

    pub waveform: [i16; WAVEFORM_LENGTH],
    pub waveform_peak_scaled: f32,
    pub waveform_peak_scaled_last: f32,
    pub note_chroma: [f32; NUM_CHROMA],
    pub note_chroma_max: f32,

    pub snare_energy: f32,
    pub hihat_energy: f32,
    pub snare_trigger: bool,
    pub hihat_trigger: bool,

    pub tempo_bpm: f32,
    pub tempo_confidence: f32,
    pub tempo_locked: bool,
    pub beat_tick: bool,
    pub beat_strength: f32,
    pub beat_phase01: f32,
    pub beat_in_bar: u8,
    pub downbeat_tick: bool,

    pub chord: ChordState,
    /// Blend of tempo confidence and flux driving global speed trims.
    pub liveliness: f32,
    /// Fade toward 0.0 after sustained silence, back to 1.0 on audio.
    pub silent_scale: f32,
    pub is_silent: bool,
}

impl Default for ControlBusFrame {
    fn default() -> Self {
        ControlBusFrame {
            t: AudioTime::default(),
            hop_seq: 0,
            rms: 0.0,
            flux: 0.0,
            fast_rms: 0.0,
            fast_flux: 0.0,
            vu_level: 0.0,
            bands: [0.0; NUM_BANDS],
            heavy_bands: [0.0; NUM_BANDS],
            chroma: [0.0; NUM_CHROMA],
            heavy_chroma: [0.0; NUM_CHROMA],
            bins64: [0.0; NUM_FREQS],
            bins64_adaptive: [0.0; NUM_FREQS],
            waveform: [0; WAVEFORM_LENGTH],
            waveform_peak_scaled: 0.0,
            waveform_peak_scaled_last: 0.0,
            note_chroma: [0.0; NUM_CHROMA],
            note_chroma_max: 0.0001,
            snare_energy: 0.0,
            hihat_energy: 0.0,
            snare_trigger: false,
            hihat_trigger: false,
            tempo_bpm: 0.0,
            tempo_confidence: 0.0,
            tempo_locked: false,
            beat_tick: false,
            beat_strength: 0.0,
            beat_phase01: 0.0,
            beat_in_bar: 0,
            downbeat_tick: false,
            chord: ChordState::default(),
            liveliness: 0.0,
            silent_scale: 1.0,
            is_silent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_between_uses_the_sample_clock() {
        let a = AudioTime::new(12_800, 12_800, 1_000_000);
        let b = AudioTime::new(12_800 + 6_400, 12_800, 1_500_000);
        let dt = AudioTime::seconds_between(&a, &b);
        assert!((dt - 0.5).abs() < 1e-6);
    }

    #[test]
    fn seconds_between_rejects_backwards_clocks() {
        let a = AudioTime::new(1_000, 12_800, 0);
        let b = AudioTime::new(500, 12_800, 0);
        assert_eq!(AudioTime::seconds_between(&a, &b), 0.0);
        let unset = AudioTime::default();
        assert_eq!(AudioTime::seconds_between(&a, &unset), 0.0);
    }

    #[test]
    fn default_frame_starts_active() {
        let frame = ControlBusFrame::default();
        assert_eq!(frame.silent_scale, 1.0);
        assert!(!frame.is_silent);
        assert_eq!(frame.chord.kind, ChordType::None);
    }

    #[test]
    fn chord_root_names_follow_the_folded_layout() {
        let mut chord = ChordState::default();
        assert_eq!(chord.root_name(), "D#");
        chord.root_note = 6;
        assert_eq!(chord.root_name(), "A");
        chord.root_note = 9;
        assert_eq!(chord.root_name(), "C");
    }
}
