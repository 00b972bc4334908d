//! Auto-ranging VU meter.
//!
//! Tracks the squared peak amplitude of each chunk, subtracts a slowly
//! refreshed noise floor, normalizes against an adaptive amplitude cap and
//! smooths the result over a short ring. `vu_max` holds the loudest level
//! seen since the novelty tracker last drained it.

use crate::audio::history::{SampleHistory, SAMPLE_HISTORY_LENGTH};

pub const NUM_VU_LOG_SAMPLES: usize = 20;
pub const NUM_VU_SMOOTH_SAMPLES: usize = 12;

/// Chunks between noise-floor refreshes, about 250 ms at the 200 Hz chunk
/// cadence.
const FLOOR_REFRESH_CHUNKS: u32 = 50;

const CHUNK_SIZE: usize = crate::audio::spectral::CHUNK_SIZE;

#[inline]
fn clip_unit(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

pub struct VuMeter {
    log: [f32; NUM_VU_LOG_SAMPLES],
    log_index: usize,
    smooth: [f32; NUM_VU_SMOOTH_SAMPLES],
    smooth_index: usize,
    frame_count: u32,
    max_amplitude_cap: f32,
    floor: f32,
    level: f32,
    max_since_drain: f32,
}

impl VuMeter {
    pub fn new() -> Self {
        VuMeter {
            log: [0.0; NUM_VU_LOG_SAMPLES],
            log_index: 0,
            smooth: [0.0; NUM_VU_SMOOTH_SAMPLES],
            smooth_index: 0,
            frame_count: 0,
            max_amplitude_cap: 0.0000001,
            floor: 0.0,
            level: 0.0,
            max_since_drain: 0.0,
        }
    }

    /// Run one chunk of VU tracking over the newest samples in the history.
    pub fn process_chunk(&mut self, history: &SampleHistory) {
        let samples = history.tail(CHUNK_SIZE);
        debug_assert_eq!(samples.len(), CHUNK_SIZE);
        debug_assert!(SAMPLE_HISTORY_LENGTH > CHUNK_SIZE);

        let mut max_amplitude = 0.000001f32;
        for &sample in samples {
            let abs = sample.abs();
            max_amplitude = max_amplitude.max(abs * abs);
        }
        let mut max_amplitude = clip_unit(max_amplitude);

        self.frame_count += 1;
        if self.frame_count >= FLOOR_REFRESH_CHUNKS {
            self.frame_count = 0;
            self.log[self.log_index] = max_amplitude;
            self.log_index = (self.log_index + 1) % NUM_VU_LOG_SAMPLES;

            let sum: f32 = self.log.iter().sum();
            self.floor = (sum / NUM_VU_LOG_SAMPLES as f32) * 0.90;
        }

        max_amplitude = (max_amplitude - self.floor).max(0.0);

        // Fast-follow amplitude cap, same rate up and down.
        if max_amplitude > self.max_amplitude_cap {
            self.max_amplitude_cap += (max_amplitude - self.max_amplitude_cap) * 0.1;
        } else {
            self.max_amplitude_cap -= (self.max_amplitude_cap - max_amplitude) * 0.1;
        }
        self.max_amplitude_cap = clip_unit(self.max_amplitude_cap).max(0.000025);

        let auto_scale = 1.0 / self.max_amplitude_cap.max(0.00001);
        let level_raw = clip_unit(max_amplitude * auto_scale);

        self.smooth[self.smooth_index] = level_raw;
        self.smooth_index = (self.smooth_index + 1) % NUM_VU_SMOOTH_SAMPLES;
        let sum: f32 = self.smooth.iter().sum();
        self.level = sum / NUM_VU_SMOOTH_SAMPLES as f32;

        self.max_since_drain = self.max_since_drain.max(self.level);
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    /// Loudest smoothed level since the last drain, then reset to a small
    /// nonzero seed. The novelty tracker drains this at its 50 Hz cadence.
    pub fn drain_max(&mut self) -> f32 {
        let max = self.max_since_drain;
        self.max_since_drain = 0.000001;
        max
    }
}

impl Default for VuMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(vu: &mut VuMeter, history: &mut SampleHistory, chunks: usize, amplitude: f32) {
        let mut phase = 0.0f32;
        for _ in 0..chunks {
            let chunk: Vec<f32> = (0..CHUNK_SIZE)
                .map(|_| {
                    phase += 2.0 * std::f32::consts::PI * 440.0 / 12_800.0;
                    phase.sin() * amplitude
                })
                .collect();
            history.append_chunk(&chunk).unwrap();
            vu.process_chunk(history);
        }
    }

    #[test]
    fn silence_reads_near_zero() {
        let mut vu = VuMeter::new();
        let mut h = SampleHistory::new();
        feed(&mut vu, &mut h, 200, 0.0);
        assert!(vu.level() < 0.05, "silent input should read low: {}", vu.level());
    }

    #[test]
    fn steady_tone_settles_high() {
        let mut vu = VuMeter::new();
        let mut h = SampleHistory::new();
        feed(&mut vu, &mut h, 40, 0.5);
        // Cap converges onto the tone's peak, so the normalized level rides
        // near full scale.
        assert!(vu.level() > 0.8, "tone should read high: {}", vu.level());
        assert!(vu.level() <= 1.0);
    }

    #[test]
    fn drain_max_resets_between_reads() {
        let mut vu = VuMeter::new();
        let mut h = SampleHistory::new();
        feed(&mut vu, &mut h, 40, 0.5);
        let first = vu.drain_max();
        assert!(first > 0.8);

        feed(&mut vu, &mut h, 5, 0.0);
        let second = vu.drain_max();
        assert!(second < first);
    }

    #[test]
    fn level_is_always_in_unit_range() {
        let mut vu = VuMeter::new();
        let mut h = SampleHistory::new();
        feed(&mut vu, &mut h, 30, 100.0);
        assert!((0.0..=1.0).contains(&vu.level()));
        feed(&mut vu, &mut h, 30, 0.0001);
        assert!((0.0..=1.0).contains(&vu.level()));
    }
}
