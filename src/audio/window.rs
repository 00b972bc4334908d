//! Shared Gaussian window lookup table.
//!
//! One 4096-entry table serves every Goertzel resonator: each bin sweeps the
//! whole table across its own block length using a fractional step
//! (`4096 / block_size`), so bins of different block sizes share one LUT.

pub const WINDOW_LOOKUP_LENGTH: usize = 4096;

/// Precomputed window weights.
pub struct WindowLookup {
    table: Box<[f32; WINDOW_LOOKUP_LENGTH]>,
}

impl WindowLookup {
    /// Build the table: a Gaussian (sigma 0.8, relative to the half-width)
    /// over the first 2048 entries, mirrored into the upper half.
    pub fn new() -> Self {
        let mut table = Box::new([0.0f32; WINDOW_LOOKUP_LENGTH]);
        let half = (WINDOW_LOOKUP_LENGTH / 2) as i32;
        for i in 0..WINDOW_LOOKUP_LENGTH / 2 {
            let sigma = 0.8f32;
            let n_minus_half = (i as i32 - half / 2) as f32;
            let weight = (-0.5 * (n_minus_half / (sigma * half as f32 / 2.0)).powi(2)).exp();
            table[i] = weight;
            table[WINDOW_LOOKUP_LENGTH - 1 - i] = weight;
        }
        WindowLookup { table }
    }

    #[inline]
    pub fn at(&self, pos: f32) -> f32 {
        self.table[pos as usize]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.table[..]
    }
}

impl Default for WindowLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_at_quarter_points() {
        // The table is a half-length Gaussian mirrored into the upper half,
        // so it peaks at 1024 and again at 3071.
        let w = WindowLookup::new();
        assert!((w.at(1024.0) - 1.0).abs() < 1e-6);
        assert!((w.at(3071.0) - 1.0).abs() < 1e-6);
        assert!(w.at(0.0) < 0.5);
        assert!(w.at(4095.0) < 0.5);
    }

    #[test]
    fn mirrored_halves_match() {
        let w = WindowLookup::new();
        for i in 0..2048usize {
            let a = w.as_slice()[i];
            let b = w.as_slice()[4095 - i];
            assert_eq!(a, b);
        }
    }

    #[test]
    fn all_weights_in_unit_range() {
        let w = WindowLookup::new();
        for &v in w.as_slice() {
            assert!(v > 0.0 && v <= 1.0);
        }
    }
}
