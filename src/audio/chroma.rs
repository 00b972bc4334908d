//! Pitch-class folding of the smooth spectrogram.

use crate::audio::spectral::NUM_FREQS;

pub const NUM_CHROMA: usize = 12;

/// Bins folded into the chromagram. Five octaves starting at the bottom
/// bin; the top four bins sit above the musically useful range.
const CHROMA_SOURCE_BINS: usize = 60;

#[derive(Clone, Copy, Debug)]
pub struct Chromagram {
    values: [f32; NUM_CHROMA],
}

impl Chromagram {
    pub fn new() -> Self {
        Chromagram {
            values: [0.0; NUM_CHROMA],
        }
    }

    /// Fold the smooth spectrogram into 12 pitch classes and auto-scale so
    /// the loudest class reads 1.0. The scale reference floors at 0.2, so a
    /// quiet spectrum is not blown up to full scale.
    pub fn update(&mut self, spectrogram_smooth: &[f32; NUM_FREQS]) {
        self.values = [0.0; NUM_CHROMA];

        let mut max_val = 0.2f32;
        for i in 0..CHROMA_SOURCE_BINS {
            self.values[i % NUM_CHROMA] += spectrogram_smooth[i] / 5.0;
            max_val = max_val.max(self.values[i % NUM_CHROMA]);
        }

        let auto_scale = 1.0 / max_val;
        for value in &mut self.values {
            *value *= auto_scale;
        }
    }

    pub fn values(&self) -> &[f32; NUM_CHROMA] {
        &self.values
    }
}

impl Default for Chromagram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pitch_class_dominates() {
        let mut spec = [0.0f32; NUM_FREQS];
        // Bin 18 is A (220 Hz); every 12th bin shares its pitch class.
        spec[18] = 1.0;
        spec[30] = 0.8;

        let mut chroma = Chromagram::new();
        chroma.update(&spec);

        let a_class = 18 % NUM_CHROMA;
        assert!((chroma.values()[a_class] - 1.0).abs() < 1e-6);
        for (class, &v) in chroma.values().iter().enumerate() {
            if class != a_class {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn quiet_spectrum_is_not_blown_up() {
        let mut spec = [0.0f32; NUM_FREQS];
        spec[0] = 0.05;

        let mut chroma = Chromagram::new();
        chroma.update(&spec);

        // 0.05 / 5 accumulated, scaled by 1/0.2 floor.
        assert!((chroma.values()[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn top_four_bins_are_ignored() {
        let mut spec = [0.0f32; NUM_FREQS];
        for i in CHROMA_SOURCE_BINS..NUM_FREQS {
            spec[i] = 1.0;
        }

        let mut chroma = Chromagram::new();
        chroma.update(&spec);
        assert!(chroma.values().iter().all(|&v| v == 0.0));
    }
}
