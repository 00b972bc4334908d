//! Spectral-flux novelty history and silence detection.
//!
//! The tracker logs at a fixed 50 Hz regardless of the audio chunk rate,
//! using an absolute deadline so the log cadence does not drift with jitter
//! in the caller. Each tick appends `log1p(flux)` to the novelty curve and
//! the positive VU delta to a parallel loudness curve; both carry an
//! autoscaled normalized copy for the tempo resonators.

pub const NOVELTY_HISTORY_LENGTH: usize = 1024;
pub const NOVELTY_LOG_HZ: u32 = 50;

const LOG_INTERVAL_US: u64 = 1_000_000 / NOVELTY_LOG_HZ as u64;

/// 2.56 s of novelty at the log rate.
const SILENCE_WINDOW_FRAMES: usize = (2.56 * NOVELTY_LOG_HZ as f64) as usize;

const CURVE_FLOOR: f32 = 0.00001;

pub struct NoveltyTracker {
    novelty_curve: Box<[f32; NOVELTY_HISTORY_LENGTH]>,
    novelty_curve_normalized: Box<[f32; NOVELTY_HISTORY_LENGTH]>,
    vu_curve: Box<[f32; NOVELTY_HISTORY_LENGTH]>,
    vu_curve_normalized: Box<[f32; NOVELTY_HISTORY_LENGTH]>,
    next_log_us: Option<u64>,
    last_vu_input: Option<f32>,
    silence_detected: bool,
    silence_level: f32,
}

impl NoveltyTracker {
    pub fn new() -> Self {
        NoveltyTracker {
            novelty_curve: Box::new([0.0; NOVELTY_HISTORY_LENGTH]),
            novelty_curve_normalized: Box::new([0.0; NOVELTY_HISTORY_LENGTH]),
            vu_curve: Box::new([0.0; NOVELTY_HISTORY_LENGTH]),
            vu_curve_normalized: Box::new([0.0; NOVELTY_HISTORY_LENGTH]),
            next_log_us: None,
            last_vu_input: None,
            // Startup is treated as silence until the curve shows contrast.
            silence_detected: true,
            silence_level: 1.0,
        }
    }

    /// Whether a 50 Hz log tick is due at `now_us`, advancing the deadline
    /// when it is. The caller must follow a `true` with a `log` call.
    pub fn tick_due(&mut self, now_us: u64) -> bool {
        let next = *self.next_log_us.get_or_insert(now_us);
        if now_us >= next {
            self.next_log_us = Some(next + LOG_INTERVAL_US);
            true
        } else {
            false
        }
    }

    /// Append one tick: mean positive spectral flux plus the VU peak drained
    /// from the meter since the last tick.
    pub fn log(&mut self, flux: f32, vu_peak: f32) {
        self.check_silence();

        shift_left(&mut self.novelty_curve);
        self.novelty_curve[NOVELTY_HISTORY_LENGTH - 1] = flux.ln_1p();

        let last = self.last_vu_input.unwrap_or(vu_peak);
        let positive_difference = (vu_peak - last).max(0.0);
        shift_left(&mut self.vu_curve);
        self.vu_curve[NOVELTY_HISTORY_LENGTH - 1] = positive_difference;
        self.last_vu_input = Some(vu_peak);
    }

    /// Refresh the normalized copies of both curves, scaled by their running
    /// max. Ran by the tempo estimator ahead of each resonator pass.
    pub fn normalize(&mut self) {
        let mut max_val = 0.00001f32;
        for &v in self.novelty_curve.iter() {
            if v > max_val {
                max_val = v;
            }
        }
        let auto_scale = 1.0 / max_val;
        for (dst, &src) in self
            .novelty_curve_normalized
            .iter_mut()
            .zip(self.novelty_curve.iter())
        {
            *dst = src * auto_scale;
        }

        let mut max_val = 0.00001f32;
        for &v in self.vu_curve.iter() {
            if v > max_val {
                max_val = v;
            }
        }
        let auto_scale = 1.0 / max_val;
        for (dst, &src) in self
            .vu_curve_normalized
            .iter_mut()
            .zip(self.vu_curve.iter())
        {
            *dst = src * auto_scale;
        }
    }

    /// Contrast test over the most recent 2.56 s of normalized novelty.
    ///
    /// Low contrast means no onsets are landing; the history is decayed in
    /// proportion to the silence level so the running max cannot pin the
    /// normalized curve at a stale loud reference through a long quiet
    /// passage.
    fn check_silence(&mut self) {
        let start = (NOVELTY_HISTORY_LENGTH - 1) - SILENCE_WINDOW_FRAMES;
        let mut min_val = 1.0f32;
        let mut max_val = 0.0f32;
        for i in 0..SILENCE_WINDOW_FRAMES {
            let recent = self.novelty_curve_normalized[start + i].min(0.5) * 2.0;
            let scaled = recent.sqrt();
            max_val = max_val.max(scaled);
            min_val = min_val.min(scaled);
        }
        let contrast = (max_val - min_val).abs();
        let silence_raw = 1.0 - contrast;

        self.silence_level = (silence_raw - 0.5).max(0.0) * 2.0;
        if silence_raw > 0.5 {
            self.silence_detected = true;
            self.decay_history(self.silence_level * 0.10);
        } else {
            self.silence_level = 0.0;
            self.silence_detected = false;
        }
    }

    fn decay_history(&mut self, reduction_amount: f32) {
        let keep = 1.0 - reduction_amount;
        for v in self.novelty_curve.iter_mut() {
            *v = (*v * keep).max(CURVE_FLOOR);
        }
        for v in self.vu_curve.iter_mut() {
            *v = (*v * keep).max(CURVE_FLOOR);
        }
    }

    pub fn normalized(&self) -> &[f32; NOVELTY_HISTORY_LENGTH] {
        &self.novelty_curve_normalized
    }

    pub fn vu_normalized(&self) -> &[f32; NOVELTY_HISTORY_LENGTH] {
        &self.vu_curve_normalized
    }

    /// Newest raw novelty value.
    pub fn last_novelty(&self) -> f32 {
        self.novelty_curve[NOVELTY_HISTORY_LENGTH - 1]
    }

    pub fn silence_detected(&self) -> bool {
        self.silence_detected
    }

    pub fn silence_level(&self) -> f32 {
        self.silence_level
    }
}

impl Default for NoveltyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn shift_left(curve: &mut [f32; NOVELTY_HISTORY_LENGTH]) {
    curve.copy_within(1.., 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_silent() {
        let t = NoveltyTracker::new();
        assert!(t.silence_detected());
        assert_eq!(t.silence_level(), 1.0);
    }

    #[test]
    fn tick_cadence_is_fifty_hz() {
        let mut t = NoveltyTracker::new();
        // 5 ms chunks: every 4th poll is due.
        let mut due = 0;
        for chunk in 0..400u64 {
            if t.tick_due(chunk * 5_000) {
                due += 1;
                t.log(0.0, 0.0);
            }
        }
        assert_eq!(due, 100);
    }

    #[test]
    fn onsets_clear_silence_flag() {
        let mut t = NoveltyTracker::new();
        for i in 0..(SILENCE_WINDOW_FRAMES * 3) {
            let flux = if i % 25 == 0 { 1.0 } else { 0.0 };
            t.log(flux, 0.0);
            t.normalize();
        }
        assert!(!t.silence_detected());
        assert_eq!(t.silence_level(), 0.0);
    }

    #[test]
    fn flat_input_decays_history() {
        let mut t = NoveltyTracker::new();
        // Establish a loud history, then go quiet.
        for i in 0..(SILENCE_WINDOW_FRAMES * 3) {
            let flux = if i % 25 == 0 { 1.0 } else { 0.0 };
            t.log(flux, 0.0);
            t.normalize();
        }
        let loud_peak = t
            .novelty_curve
            .iter()
            .cloned()
            .fold(0.0f32, f32::max);

        for _ in 0..(SILENCE_WINDOW_FRAMES * 3) {
            t.log(0.0, 0.0);
            t.normalize();
        }
        assert!(t.silence_detected());
        let quiet_peak = t
            .novelty_curve
            .iter()
            .cloned()
            .fold(0.0f32, f32::max);
        assert!(
            quiet_peak < loud_peak * 0.5,
            "history should decay in silence: {quiet_peak} vs {loud_peak}"
        );
    }

    #[test]
    fn vu_curve_tracks_positive_deltas_only() {
        let mut t = NoveltyTracker::new();
        t.log(0.0, 0.5);
        t.log(0.0, 0.8);
        t.log(0.0, 0.2);
        let n = NOVELTY_HISTORY_LENGTH;
        // First tick seeds the delta reference, so it logs zero.
        assert_eq!(t.vu_curve[n - 3], 0.0);
        assert!((t.vu_curve[n - 2] - 0.3).abs() < 1e-6);
        assert_eq!(t.vu_curve[n - 1], 0.0);
    }

    #[test]
    fn normalized_curve_peaks_at_one() {
        let mut t = NoveltyTracker::new();
        for i in 0..200 {
            t.log(if i == 100 { 2.0 } else { 0.1 }, 0.0);
        }
        t.normalize();
        let peak = t.normalized().iter().cloned().fold(0.0f32, f32::max);
        assert!((peak - 1.0).abs() < 1e-6);
    }
}
