//! 64-bin Goertzel spectral bank.
//!
//! Each bin is a single-frequency DFT resonator targeting one entry of a
//! quarter-tone pitch table, so the spectrogram is musically spaced rather
//! than linearly spaced. Per chunk only half the bins (even or odd,
//! alternating) are recomputed; the rest carry their previous magnitude.
//! Downstream of the raw magnitudes: a slow per-bin noise floor, a 2-frame
//! moving average, a peak-tracking autoranger, and a 12-frame boxcar that
//! produces the display-grade smooth spectrogram.

use crate::audio::history::{SampleHistory, SAMPLE_HISTORY_LENGTH};
use crate::audio::window::WindowLookup;

pub const NUM_FREQS: usize = 64;
pub const SAMPLE_RATE: u32 = 12_800;
pub const CHUNK_SIZE: usize = 64;

/// Chunk cadence the smoothing constants were tuned at.
pub const BASELINE_CHUNK_RATE_HZ: f32 = 12_800.0 / 64.0;
pub const CHUNK_RATE_HZ: f32 = SAMPLE_RATE as f32 / CHUNK_SIZE as f32;

const BOTTOM_NOTE: usize = 12;
const NOTE_STEP: usize = 2;
const NOISE_HISTORY_SLOTS: usize = 10;
const NOISE_LOG_INTERVAL_MS: u64 = 1000;
const MAGNITUDE_AVERAGE_SAMPLES: usize = 2;
const SPECTROGRAM_AVERAGE_SAMPLES: usize = 12;
const AUTORANGER_FLOOR: f32 = 0.0025;

/// Equal-tempered quarter-tone table from A1 (55 Hz) upward. Bins sample
/// every second entry (half-step spacing) starting at `BOTTOM_NOTE`.
#[rustfmt::skip]
const NOTES: [f32; 198] = [
    55.0, 56.635235, 58.27047, 60.00294, 61.73541, 63.5709, 65.40639, 67.351025, 69.29566, 71.355925, 73.41619, 75.59897,
    77.78175, 80.09432, 82.40689, 84.856975, 87.30706, 89.902835, 92.49861, 95.248735, 97.99886, 100.91253, 103.8262, 106.9131,
    110.0, 113.27045, 116.5409, 120.00585, 123.4708, 127.1418, 130.8128, 134.70205, 138.5913, 142.71185, 146.8324, 151.19795,
    155.5635, 160.18865, 164.8138, 169.71395, 174.6141, 179.80565, 184.9972, 190.49745, 195.9977, 201.825, 207.6523, 213.82615,
    220.0, 226.54095, 233.0819, 240.0118, 246.9417, 254.28365, 261.6256, 269.4041, 277.1826, 285.4237, 293.6648, 302.3959,
    311.127, 320.3773, 329.6276, 339.4279, 349.2282, 359.6113, 369.9944, 380.9949, 391.9954, 403.65005, 415.3047, 427.65235,
    440.0, 453.0819, 466.1638, 480.02355, 493.8833, 508.5672, 523.2511, 538.8082, 554.3653, 570.8474, 587.3295, 604.79175,
    622.254, 640.75455, 659.2551, 678.8558, 698.4565, 719.22265, 739.9888, 761.98985, 783.9909, 807.30015, 830.6094, 855.3047,
    880.0, 906.16375, 932.3275, 960.04705, 987.7666, 1017.1343, 1046.502, 1077.6165, 1108.731, 1141.695, 1174.659, 1209.5835,
    1244.508, 1281.509, 1318.51, 1357.7115, 1396.913, 1438.4455, 1479.978, 1523.98, 1567.982, 1614.6005, 1661.219, 1710.6095,
    1760.0, 1812.3275, 1864.655, 1920.094, 1975.533, 2034.269, 2093.005, 2155.233, 2217.461, 2283.3895, 2349.318, 2419.167,
    2489.016, 2563.018, 2637.02, 2715.4225, 2793.825, 2876.8905, 2959.956, 3047.96, 3135.964, 3229.2005, 3322.437, 3421.2185,
    3520.0, 3624.655, 3729.31, 3840.1875, 3951.065, 4068.537, 4186.009, 4310.4655, 4434.922, 4566.779, 4698.636, 4838.334,
    4978.032, 5126.0365, 5274.041, 5430.8465, 5587.652, 5753.7815, 5919.911, 6095.919, 6271.927, 6458.401, 6644.875, 6842.4375,
    7040.0, 7249.31, 7458.62, 7680.375, 7902.13, 8137.074, 8372.018, 8620.931, 8869.844, 9133.558, 9397.272, 9676.668,
    9956.064, 10252.072, 10548.08, 10861.69, 11175.3, 11507.56, 11839.82, 12191.835, 12543.85, 12916.8, 13289.75, 13684.875,
    14080.0, 14498.62, 14917.24, 15360.75, 15804.26, 16274.145,
];

#[inline]
fn clip_unit(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

/// One Goertzel resonator.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrequencyBin {
    pub target_freq: f32,
    pub coeff: f32,
    pub window_step: f32,
    pub block_size: usize,
    /// Autoranged magnitude in [0,1].
    pub magnitude: f32,
    /// Noise-filtered magnitude before autoranging.
    pub magnitude_full_scale: f32,
    /// Previous smooth magnitude, for the novelty (flux) delta.
    pub magnitude_last: f32,
    /// Positive delta vs `magnitude_last` from the last flux pass.
    pub novelty: f32,
}

impl FrequencyBin {
    fn tune(&mut self, frequency: f32, bandwidth: f32) {
        self.target_freq = frequency;
        let mut block_size = (SAMPLE_RATE as f32 / bandwidth) as usize;
        while block_size % 4 != 0 {
            block_size -= 1;
        }
        if block_size > SAMPLE_HISTORY_LENGTH - 1 {
            block_size = SAMPLE_HISTORY_LENGTH - 1;
        }
        self.block_size = block_size;
        self.window_step = 4096.0 / block_size as f32;

        let k = (0.5 + (block_size as f32 * frequency) / SAMPLE_RATE as f32) as i32 as f32;
        let w = (2.0 * std::f32::consts::PI * k) / block_size as f32;
        self.coeff = 2.0 * w.cos();
    }
}

/// The spectral half of the producer pipeline.
pub struct SpectralAnalyzer {
    bins: [FrequencyBin; NUM_FREQS],

    magnitudes_raw: [f32; NUM_FREQS],
    magnitudes_noise_filtered: [f32; NUM_FREQS],
    magnitudes_avg: [[f32; NUM_FREQS]; MAGNITUDE_AVERAGE_SAMPLES],
    noise_floor: [f32; NUM_FREQS],
    noise_history: [[f32; NUM_FREQS]; NOISE_HISTORY_SLOTS],
    noise_history_index: usize,
    last_noise_log_ms: u64,

    max_val_smooth: f32,
    iter: u32,
    interlacing_frame_field: bool,

    spectrogram: [f32; NUM_FREQS],
    spectrogram_smooth: [f32; NUM_FREQS],
    spectrogram_average: [[f32; NUM_FREQS]; SPECTROGRAM_AVERAGE_SAMPLES],
    spectrogram_average_index: usize,

    noise_alpha: f32,
    autoranger_alpha: f32,
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        let mut bins = [FrequencyBin::default(); NUM_FREQS];
        for (i, bin) in bins.iter_mut().enumerate() {
            let note = BOTTOM_NOTE + i * NOTE_STEP;
            let target = NOTES[note];
            let neighbor_distance_hz = (target - NOTES[note - 1])
                .abs()
                .max((target - NOTES[note + 1]).abs());
            // Bandwidth is 4x the quarter-tone neighbor distance.
            bin.tune(target, neighbor_distance_hz * 4.0);
        }

        // EMA rates were tuned at the 200 Hz baseline chunk cadence and are
        // retuned if the chunk rate ever differs.
        let rate_ratio = BASELINE_CHUNK_RATE_HZ / CHUNK_RATE_HZ;
        SpectralAnalyzer {
            bins,
            magnitudes_raw: [0.0; NUM_FREQS],
            magnitudes_noise_filtered: [0.0; NUM_FREQS],
            magnitudes_avg: [[0.0; NUM_FREQS]; MAGNITUDE_AVERAGE_SAMPLES],
            noise_floor: [0.0; NUM_FREQS],
            noise_history: [[0.0; NUM_FREQS]; NOISE_HISTORY_SLOTS],
            noise_history_index: 0,
            last_noise_log_ms: 0,
            max_val_smooth: 0.0,
            iter: 0,
            interlacing_frame_field: false,
            spectrogram: [0.0; NUM_FREQS],
            spectrogram_smooth: [0.0; NUM_FREQS],
            spectrogram_average: [[0.0; NUM_FREQS]; SPECTROGRAM_AVERAGE_SAMPLES],
            spectrogram_average_index: 0,
            noise_alpha: 1.0 - 0.99f32.powf(rate_ratio),
            autoranger_alpha: 1.0 - 0.995f32.powf(rate_ratio),
        }
    }

    /// Run one chunk of spectral analysis over the current history.
    ///
    /// `now_ms` drives the 1 Hz noise-spectrum log; it only needs to be
    /// monotonic.
    pub fn process_chunk(&mut self, history: &SampleHistory, window: &WindowLookup, now_ms: u64) {
        if now_ms.wrapping_sub(self.last_noise_log_ms) >= NOISE_LOG_INTERVAL_MS {
            self.last_noise_log_ms = now_ms;
            self.noise_history_index = (self.noise_history_index + 1) % NOISE_HISTORY_SLOTS;
            self.noise_history[self.noise_history_index] = self.magnitudes_raw;
        }

        self.iter = self.iter.wrapping_add(1);
        self.interlacing_frame_field = !self.interlacing_frame_field;

        let mut max_val = 0.0f32;
        for i in 0..NUM_FREQS {
            let interlace_field_now = i % 2 == 0;
            if interlace_field_now == self.interlacing_frame_field {
                self.magnitudes_raw[i] = self.magnitude_of_bin(i, history, window);

                let mut noise_avg = 0.0f32;
                for slot in &self.noise_history {
                    noise_avg += slot[i];
                }
                noise_avg /= NOISE_HISTORY_SLOTS as f32;
                noise_avg *= 0.90;

                self.noise_floor[i] =
                    self.noise_floor[i] * (1.0 - self.noise_alpha) + noise_avg * self.noise_alpha;
                self.magnitudes_noise_filtered[i] =
                    (self.magnitudes_raw[i] - self.noise_floor[i]).max(0.0);
            }

            self.bins[i].magnitude_full_scale = self.magnitudes_noise_filtered[i];
            self.magnitudes_avg[(self.iter as usize) % MAGNITUDE_AVERAGE_SAMPLES][i] =
                self.magnitudes_noise_filtered[i];

            let mut avg = 0.0f32;
            for a in 0..MAGNITUDE_AVERAGE_SAMPLES {
                avg += self.magnitudes_avg[a][i];
            }
            avg /= MAGNITUDE_AVERAGE_SAMPLES as f32;

            if avg > max_val {
                max_val = avg;
            }
            // Stash the 2-frame average in the raw-magnitude slot of the
            // autorange pass below.
            self.spectrogram[i] = avg;
        }

        // Peak tracker feeding the autoranger, moved toward the frame peak
        // at the same alpha in both directions.
        if max_val > self.max_val_smooth {
            self.max_val_smooth += (max_val - self.max_val_smooth) * self.autoranger_alpha;
        }
        if max_val < self.max_val_smooth {
            self.max_val_smooth -= (self.max_val_smooth - max_val) * self.autoranger_alpha;
        }
        if self.max_val_smooth < AUTORANGER_FLOOR {
            self.max_val_smooth = AUTORANGER_FLOOR;
        }

        let autoranger_scale = 1.0 / self.max_val_smooth;
        for i in 0..NUM_FREQS {
            let scaled = clip_unit(self.spectrogram[i] * autoranger_scale);
            self.bins[i].magnitude = scaled;
            self.spectrogram[i] = scaled;
        }

        self.spectrogram_average_index =
            (self.spectrogram_average_index + 1) % SPECTROGRAM_AVERAGE_SAMPLES;
        self.spectrogram_average[self.spectrogram_average_index] = self.spectrogram;
        for i in 0..NUM_FREQS {
            let mut sum = 0.0f32;
            for frame in &self.spectrogram_average {
                sum += frame[i];
            }
            self.spectrogram_smooth[i] = sum / SPECTROGRAM_AVERAGE_SAMPLES as f32;
        }
    }

    fn magnitude_of_bin(
        &self,
        bin_number: usize,
        history: &SampleHistory,
        window: &WindowLookup,
    ) -> f32 {
        let bin = &self.bins[bin_number];
        let block_size = bin.block_size;
        let coeff = bin.coeff;
        let window_step = bin.window_step;

        let samples = history.tail(block_size);

        let mut q1 = 0.0f32;
        let mut q2 = 0.0f32;
        let mut window_pos = 0.0f32;
        for &sample in samples {
            let windowed = sample * window.at(window_pos);
            let q0 = coeff * q1 - q2 + windowed;
            q2 = q1;
            q1 = q0;
            window_pos += window_step;
        }

        let magnitude_squared = q1 * q1 + q2 * q2 - q1 * q2 * coeff;
        let normalized = magnitude_squared / (block_size as f32 / 2.0);

        // Progressive brightness bias toward the upper bins.
        let mut progress = bin_number as f32 / NUM_FREQS as f32;
        progress *= progress;
        progress *= progress;
        let scale = progress * 0.9975 + 0.0025;

        (normalized * scale).sqrt()
    }

    /// Mean positive spectral flux of the smooth spectrogram vs the previous
    /// pass, updating each bin's `magnitude_last`/`novelty`. Called by the
    /// novelty tracker at its own 50 Hz cadence.
    pub fn mean_positive_flux(&mut self) -> f32 {
        let mut total = 0.0f32;
        for i in 0..NUM_FREQS {
            let new_mag = self.spectrogram_smooth[i];
            let delta = (new_mag - self.bins[i].magnitude_last).max(0.0);
            self.bins[i].novelty = delta;
            self.bins[i].magnitude_last = new_mag;
            total += delta;
        }
        total / NUM_FREQS as f32
    }

    pub fn spectrogram(&self) -> &[f32; NUM_FREQS] {
        &self.spectrogram
    }

    pub fn spectrogram_smooth(&self) -> &[f32; NUM_FREQS] {
        &self.spectrogram_smooth
    }

    pub fn bins(&self) -> &[FrequencyBin; NUM_FREQS] {
        &self.bins
    }
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
