//! Render-domain beat/bar clock.
//!
//! The audio side produces sparse, jittery tempo estimates and beat
//! observations; effects want a phase that advances smoothly at render-frame
//! rate and never jumps. [`MusicalGrid`] bridges the two as a software PLL:
//! a fractional beat counter free-runs on the smoothed BPM, and each beat
//! observation applies a proportional phase correction sized by its
//! strength. Every [`MusicalGrid::tick`] publishes a [`MusicalGridSnapshot`]
//! through the grid's own snapshot buffer, so effect readers on other
//! threads copy the clock out by value.

use std::sync::Arc;

use crate::audio::features::AudioTime;
use crate::sync::SnapshotBuffer;

/// How fast a consumed beat observation fades out of `beat_strength`.
const BEAT_STRENGTH_TAU_S: f32 = 0.15;

/// Musical meter, folded to sane values at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSignature {
    pub beats_per_bar: u8,
    pub beat_unit: u8,
}

impl TimeSignature {
    /// Zero fields fold to 4; beats-per-bar caps at 12 and the unit at 16.
    pub fn new(beats_per_bar: u8, beat_unit: u8) -> Self {
        let beats_per_bar = match beats_per_bar {
            0 => 4,
            n => n.min(12),
        };
        let beat_unit = match beat_unit {
            0 => 4,
            n => n.min(16),
        };
        TimeSignature {
            beats_per_bar,
            beat_unit,
        }
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        TimeSignature {
            beats_per_bar: 4,
            beat_unit: 4,
        }
    }
}

/// PLL behavior knobs. The defaults track a broad musical range and favor
/// stability over reaction speed.
#[derive(Clone, Copy, Debug)]
pub struct GridTuning {
    pub bpm_min: f32,
    pub bpm_max: f32,
    /// BPM smoothing time constant in render-domain seconds.
    pub bpm_tau_s: f32,
    /// Confidence decay time constant while no observations arrive.
    pub confidence_tau_s: f32,
    /// Fraction of the observed phase error corrected per beat observation,
    /// scaled by observation strength.
    pub phase_correction_gain: f32,
    /// Same for bar-phase error on tagged downbeats.
    pub bar_correction_gain: f32,
}

impl Default for GridTuning {
    fn default() -> Self {
        GridTuning {
            bpm_min: 30.0,
            bpm_max: 300.0,
            bpm_tau_s: 0.50,
            confidence_tau_s: 1.00,
            phase_correction_gain: 0.35,
            bar_correction_gain: 0.20,
        }
    }
}

impl GridTuning {
    /// Fold out-of-range values back into usable bounds.
    pub fn clamped(&self) -> Self {
        let mut out = *self;
        out.bpm_min = out.bpm_min.clamp(10.0, 1000.0);
        out.bpm_max = out.bpm_max.clamp(10.0, 1000.0);
        if out.bpm_max <= out.bpm_min {
            out.bpm_max = out.bpm_min + 1.0;
        }
        out.bpm_tau_s = out.bpm_tau_s.clamp(0.01, 10.0);
        out.confidence_tau_s = out.confidence_tau_s.clamp(0.01, 10.0);
        out.phase_correction_gain = out.phase_correction_gain.clamp(0.0, 1.0);
        out.bar_correction_gain = out.bar_correction_gain.clamp(0.0, 1.0);
        out
    }
}

/// One render frame of the beat/bar clock, published by value.
#[derive(Clone, Copy, Debug, Default)]
pub struct MusicalGridSnapshot {
    pub t: AudioTime,
    pub bpm_smoothed: f32,
    pub tempo_confidence: f32,
    /// Fraction into the current beat, [0,1).
    pub beat_phase01: f32,
    /// Fraction into the current bar, [0,1).
    pub bar_phase01: f32,
    pub beat_index: u64,
    pub bar_index: u64,
    pub beat_in_bar: u8,
    pub beats_per_bar: u8,
    pub beat_unit: u8,
    /// True only on the exact frame a beat boundary was crossed.
    pub beat_tick: bool,
    pub downbeat_tick: bool,
    /// Strength of the most recent observation, decaying over ~150 ms.
    pub beat_strength: f32,
}

#[derive(Clone, Copy)]
struct PendingBeat {
    t: AudioTime,
    strength: f32,
    is_downbeat: bool,
}

#[derive(Clone, Copy)]
struct ExternalBeat {
    bpm: f32,
    phase01: f32,
    beat_tick: bool,
    downbeat_tick: bool,
    beat_in_bar: u8,
}

impl Default for ExternalBeat {
    fn default() -> Self {
        ExternalBeat {
            bpm: 120.0,
            phase01: 0.0,
            beat_tick: false,
            downbeat_tick: false,
            beat_in_bar: 0,
        }
    }
}

/// Phase-locked loop turning sparse audio-domain observations into a smooth
/// render-domain beat clock.
pub struct MusicalGrid {
    tuning: GridTuning,
    signature: TimeSignature,

    has_tick: bool,
    last_tick_t: AudioTime,
    bpm_target: f32,
    bpm_smoothed: f32,
    conf: f32,
    /// Continuous beat counter; the integer part is the beat index, the
    /// fraction the phase.
    beat_float: f64,
    prev_beat_index: u64,
    last_beat_strength: f32,

    pending: Option<PendingBeat>,

    external_sync: bool,
    external: ExternalBeat,

    snap: Arc<SnapshotBuffer<MusicalGridSnapshot>>,
}

impl MusicalGrid {
    pub fn new(tuning: GridTuning) -> Self {
        let mut grid = MusicalGrid {
            tuning: tuning.clamped(),
            signature: TimeSignature::default(),
            has_tick: false,
            last_tick_t: AudioTime::default(),
            bpm_target: 120.0,
            bpm_smoothed: 120.0,
            conf: 0.0,
            beat_float: 0.0,
            prev_beat_index: 0,
            last_beat_strength: 0.0,
            pending: None,
            external_sync: false,
            external: ExternalBeat::default(),
            snap: Arc::new(SnapshotBuffer::new(MusicalGridSnapshot::default())),
        };
        grid.publish_seed();
        grid
    }

    /// Return the grid to the just-constructed state and publish the seed
    /// snapshot so readers never see stale clock values.
    pub fn reset(&mut self) {
        self.has_tick = false;
        self.last_tick_t = AudioTime::default();
        self.bpm_target = 120.0;
        self.bpm_smoothed = 120.0;
        self.conf = 0.0;
        self.beat_float = 0.0;
        self.prev_beat_index = 0;
        self.last_beat_strength = 0.0;
        self.pending = None;
        self.publish_seed();
    }

    fn publish_seed(&self) {
        let snapshot = MusicalGridSnapshot {
            bpm_smoothed: self.bpm_smoothed,
            tempo_confidence: self.conf,
            beats_per_bar: self.signature.beats_per_bar,
            beat_unit: self.signature.beat_unit,
            ..MusicalGridSnapshot::default()
        };
        self.snap.publish(snapshot);
    }

    pub fn set_time_signature(&mut self, signature: TimeSignature) {
        self.signature = signature;
    }

    pub fn set_tuning(&mut self, tuning: GridTuning) {
        self.tuning = tuning.clamped();
    }

    /// Shared handle for effect readers on other threads.
    pub fn snapshot_buffer(&self) -> Arc<SnapshotBuffer<MusicalGridSnapshot>> {
        Arc::clone(&self.snap)
    }

    /// Feed one tempo estimate from the audio side. BPM is clamped into the
    /// configured range; confidence can only rise here, it decays in
    /// [`tick`](Self::tick).
    pub fn on_tempo_estimate(&mut self, bpm: f32, confidence01: f32) {
        self.bpm_target = bpm.clamp(self.tuning.bpm_min, self.tuning.bpm_max);
        let confidence01 = confidence01.clamp(0.0, 1.0);
        if confidence01 > self.conf {
            self.conf = confidence01;
        }
    }

    /// Stage one time-stamped beat observation. The correction is applied by
    /// the next `tick` whose render time has caught up to `t`.
    pub fn on_beat_observation(&mut self, t: AudioTime, strength01: f32, is_downbeat: bool) {
        let strength = strength01.clamp(0.0, 1.0);
        self.pending = Some(PendingBeat {
            t,
            strength,
            is_downbeat,
        });
        self.last_beat_strength = strength;
        if strength > self.conf {
            self.conf = strength;
        }
    }

    /// Replace the PLL output with an out-of-band clock. Tick flags are
    /// one-shot: they publish once and clear.
    pub fn inject_external_beat(
        &mut self,
        bpm: f32,
        phase01: f32,
        is_tick: bool,
        is_downbeat: bool,
        beat_in_bar: u8,
    ) {
        let bpm = bpm.clamp(self.tuning.bpm_min, self.tuning.bpm_max);
        let beat_in_bar = if beat_in_bar < self.signature.beats_per_bar {
            beat_in_bar
        } else {
            0
        };
        self.external = ExternalBeat {
            bpm,
            phase01: phase01.clamp(0.0, 1.0),
            beat_tick: is_tick,
            downbeat_tick: is_downbeat,
            beat_in_bar,
        };
        self.bpm_smoothed = bpm;
        self.bpm_target = bpm;
        self.conf = 1.0;
        self.beat_float = f64::from(self.external.phase01) + f64::from(beat_in_bar);
    }

    pub fn set_external_sync_mode(&mut self, enabled: bool) {
        self.external_sync = enabled;
        if !enabled {
            self.external = ExternalBeat::default();
        }
    }

    /// Advance the clock to `render_now`, publish the resulting snapshot and
    /// return it. Runs once per render frame.
    pub fn tick(&mut self, render_now: AudioTime) -> MusicalGridSnapshot {
        if self.external_sync {
            return self.tick_external(render_now);
        }

        if !self.has_tick {
            // First tick seeds the timebase without inventing history.
            self.has_tick = true;
            self.last_tick_t = render_now;
            self.prev_beat_index = 0;

            let snapshot = MusicalGridSnapshot {
                t: render_now,
                bpm_smoothed: self.bpm_smoothed,
                tempo_confidence: self.conf,
                beats_per_bar: self.signature.beats_per_bar,
                beat_unit: self.signature.beat_unit,
                ..MusicalGridSnapshot::default()
            };
            self.snap.publish(snapshot);
            return snapshot;
        }

        // The sample index is the authoritative clock. A render frame that
        // lands behind the last one would integrate a negative dt and blow
        // up the phase, so it just re-reads the last snapshot.
        let ds = render_now.sample_index as i64 - self.last_tick_t.sample_index as i64;
        if ds < 0 {
            return self.snap.read_latest().0;
        }
        let dt_s = if render_now.sample_rate_hz > 0 {
            ds as f32 / render_now.sample_rate_hz as f32
        } else {
            0.0
        };

        let alpha = 1.0 - (-dt_s / self.tuning.bpm_tau_s).exp();
        self.bpm_smoothed += (self.bpm_target - self.bpm_smoothed) * alpha;

        // Confidence and beat strength decay between observations; strength
        // fades fast enough to read as a per-beat pulse.
        self.conf *= (-dt_s / self.tuning.confidence_tau_s).exp();
        self.last_beat_strength *= (-dt_s / BEAT_STRENGTH_TAU_S).exp();

        self.beat_float += f64::from(dt_s) * (f64::from(self.bpm_smoothed) / 60.0);

        if let Some(pending) = self.pending {
            if render_now.sample_index >= pending.t.sample_index {
                self.apply_correction(render_now, pending);
                self.pending = None;
            }
        }

        let beat_index = self.beat_float.floor() as u64;
        let beat_phase01 = self.beat_float.fract() as f32;

        let beats_per_bar = self.signature.beats_per_bar;
        let bar_float = self.beat_float / f64::from(beats_per_bar);
        let bar_index = bar_float.floor() as u64;
        let bar_phase01 = bar_float.fract() as f32;

        // Edge-triggered: one tick per crossing even if the renderer
        // stuttered across several beats.
        let beat_tick = beat_index != self.prev_beat_index;
        self.prev_beat_index = beat_index;

        let beat_in_bar = (beat_index % u64::from(beats_per_bar)) as u8;
        let downbeat_tick = beat_tick && beat_in_bar == 0;

        self.last_tick_t = render_now;

        let snapshot = MusicalGridSnapshot {
            t: render_now,
            bpm_smoothed: self.bpm_smoothed,
            tempo_confidence: self.conf.clamp(0.0, 1.0),
            beat_phase01,
            bar_phase01,
            beat_index,
            bar_index,
            beat_in_bar,
            beats_per_bar,
            beat_unit: self.signature.beat_unit,
            beat_tick,
            downbeat_tick,
            beat_strength: self.last_beat_strength,
        };
        self.snap.publish(snapshot);
        snapshot
    }

    /// Proportional phase correction against the phase the counter predicts
    /// for the observation's timestamp. Strong beats pull harder; nothing
    /// ever hard-jumps the counter.
    fn apply_correction(&mut self, render_now: AudioTime, pending: PendingBeat) {
        let sr = f64::from(render_now.sample_rate_hz);
        let samples_per_beat = if sr > 0.0 {
            sr * 60.0 / f64::from(self.bpm_smoothed)
        } else {
            1.0
        };

        let samples_back = (render_now.sample_index - pending.t.sample_index) as f64;
        let beats_back = samples_back / samples_per_beat;
        let beat_at_obs = self.beat_float - beats_back;

        let phase_err = wrap_half(beat_at_obs.fract() as f32);
        self.beat_float -=
            f64::from(phase_err * self.tuning.phase_correction_gain * pending.strength);

        if pending.is_downbeat {
            let beats_per_bar = f64::from(self.signature.beats_per_bar);
            let bar_err = wrap_half((beat_at_obs / beats_per_bar).fract() as f32);
            self.beat_float -= f64::from(
                bar_err
                    * self.signature.beats_per_bar as f32
                    * self.tuning.bar_correction_gain
                    * pending.strength,
            );
        }

        // A consumed observation is live signal.
        if pending.strength > self.conf {
            self.conf = pending.strength;
        }
    }

    fn tick_external(&mut self, render_now: AudioTime) -> MusicalGridSnapshot {
        let beats_per_bar = self.signature.beats_per_bar;
        let beat_float = f64::from(self.external.phase01) + f64::from(self.external.beat_in_bar);

        let snapshot = MusicalGridSnapshot {
            t: render_now,
            bpm_smoothed: self.external.bpm,
            tempo_confidence: 1.0,
            beat_phase01: self.external.phase01,
            bar_phase01: self.external.phase01 / beats_per_bar as f32,
            beat_index: beat_float.floor() as u64,
            bar_index: (beat_float / f64::from(beats_per_bar)).floor() as u64,
            beat_in_bar: self.external.beat_in_bar,
            beats_per_bar,
            beat_unit: self.signature.beat_unit,
            beat_tick: self.external.beat_tick,
            downbeat_tick: self.external.downbeat_tick,
            beat_strength: if self.external.beat_tick { 1.0 } else { 0.0 },
        };

        // One-shot flags: consumed by this publish.
        self.external.beat_tick = false;
        self.external.downbeat_tick = false;

        self.snap.publish(snapshot);
        snapshot
    }
}

impl Default for MusicalGrid {
    fn default() -> Self {
        Self::new(GridTuning::default())
    }
}

/// Map [0,1) phase to a signed error in (-0.5, 0.5].
fn wrap_half(phase01: f32) -> f32 {
    if phase01 > 0.5 {
        phase01 - 1.0
    } else {
        phase01
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 12_800;

    fn at(seconds: f64) -> AudioTime {
        let samples = (seconds * RATE as f64) as u64;
        AudioTime::new(samples, RATE, (seconds * 1e6) as u64)
    }

    #[test]
    fn time_signature_folds_zeros_and_caps() {
        assert_eq!(TimeSignature::new(0, 0), TimeSignature::new(4, 4));
        let sig = TimeSignature::new(200, 200);
        assert_eq!(sig.beats_per_bar, 12);
        assert_eq!(sig.beat_unit, 16);
    }

    #[test]
    fn confidence_decays_without_observations() {
        let mut grid = MusicalGrid::default();
        grid.on_tempo_estimate(120.0, 0.9);
        grid.tick(at(0.0));

        let snapshot = grid.tick(at(5.0));
        assert!(snapshot.tempo_confidence < 0.01);
        assert!(snapshot.tempo_confidence >= 0.0);
    }

    #[test]
    fn beat_counter_free_runs_at_the_default_bpm() {
        let mut grid = MusicalGrid::default();
        grid.tick(at(0.0));

        let mut ticks = 0;
        let mut last = MusicalGridSnapshot::default();
        for frame in 1..=125 {
            last = grid.tick(at(frame as f64 * 0.01));
            if last.beat_tick {
                ticks += 1;
            }
        }

        // 1.25 s at 120 BPM crosses the beats at 0.5 s and 1.0 s.
        assert_eq!(ticks, 2);
        assert_eq!(last.beat_index, 2);
        assert_eq!(last.beat_in_bar, 2);
        assert_eq!(last.bar_index, 0);
    }

    #[test]
    fn observation_pulls_the_phase_proportionally() {
        let mut grid = MusicalGrid::default();
        grid.tick(at(0.0));
        grid.tick(at(0.125));

        // Observed beat at 0.125 s, where the counter predicts phase 0.25.
        grid.on_beat_observation(at(0.125), 1.0, false);
        let snapshot = grid.tick(at(0.130));

        // Freewheel would read 0.26; the correction removes
        // 0.25 * gain(0.35) = 0.0875 of it, not all of it.
        assert!((snapshot.beat_phase01 - 0.1725).abs() < 1e-3);
    }

    #[test]
    fn external_sync_bypasses_the_pll() {
        let mut grid = MusicalGrid::default();
        grid.set_external_sync_mode(true);
        grid.inject_external_beat(100.0, 0.75, true, true, 2);

        let snapshot = grid.tick(at(1.0));
        assert_eq!(snapshot.bpm_smoothed, 100.0);
        assert_eq!(snapshot.tempo_confidence, 1.0);
        assert_eq!(snapshot.beat_phase01, 0.75);
        assert_eq!(snapshot.beat_in_bar, 2);
        assert!(snapshot.beat_tick);
        assert!(snapshot.downbeat_tick);

        // Tick flags are one-shot.
        let second = grid.tick(at(1.01));
        assert!(!second.beat_tick);
        assert!(!second.downbeat_tick);
    }

    #[test]
    fn odd_meter_wraps_the_bar() {
        let mut grid = MusicalGrid::default();
        grid.set_time_signature(TimeSignature::new(7, 8));
        grid.tick(at(0.0));

        // 4.3 s at 120 BPM passes 8 beat boundaries, one beat into bar 1.
        let mut downbeats = 0;
        let mut last = MusicalGridSnapshot::default();
        for frame in 1..=430 {
            last = grid.tick(at(frame as f64 * 0.01));
            if last.downbeat_tick {
                downbeats += 1;
            }
        }

        assert_eq!(last.beat_index, 8);
        assert_eq!(last.beat_in_bar, 1);
        assert_eq!(last.bar_index, 1);
        assert_eq!(downbeats, 1);
    }

    #[test]
    fn backwards_render_time_rereads_the_last_snapshot() {
        let mut grid = MusicalGrid::default();
        grid.tick(at(0.0));
        let before = grid.tick(at(1.0));

        let stale = grid.tick(at(0.5));
        assert_eq!(stale.beat_index, before.beat_index);
        assert_eq!(stale.bpm_smoothed, before.bpm_smoothed);

        // The clock keeps working once time moves forward again.
        let after = grid.tick(at(1.25));
        assert!(after.beat_index >= before.beat_index);
    }

    #[test]
    fn reset_publishes_a_seed_snapshot() {
        let mut grid = MusicalGrid::default();
        grid.on_tempo_estimate(240.0, 1.0);
        for frame in 0..100 {
            grid.tick(at(frame as f64 * 0.01));
        }
        grid.reset();

        let (seed, _) = grid.snapshot_buffer().read_latest();
        assert_eq!(seed.bpm_smoothed, 120.0);
        assert_eq!(seed.beat_index, 0);
        assert_eq!(seed.tempo_confidence, 0.0);
    }
}
