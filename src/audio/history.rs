//! Rolling sample history feeding the Goertzel bank.

use crate::error::{PipelineError, Result};

pub const SAMPLE_HISTORY_LENGTH: usize = 4096;

/// Fixed-length rolling buffer of the most recent audio samples.
///
/// New chunks shift the whole buffer left and append at the tail, so the
/// newest sample always sits at the highest index. Resonators read
/// backwards from the tail over their own block lengths. The capture
/// boundary is responsible for delivering zero-centered samples; nothing
/// here re-filters them.
pub struct SampleHistory {
    samples: Box<[f32; SAMPLE_HISTORY_LENGTH]>,
}

impl SampleHistory {
    pub fn new() -> Self {
        SampleHistory {
            samples: Box::new([0.0; SAMPLE_HISTORY_LENGTH]),
        }
    }

    /// Shift the history left by `chunk.len()` and copy the chunk in at the
    /// tail. Chunks longer than the history are rejected.
    pub fn append_chunk(&mut self, chunk: &[f32]) -> Result<()> {
        let n = chunk.len();
        if n == 0 || n > SAMPLE_HISTORY_LENGTH {
            return Err(PipelineError::InvalidArgument(format!(
                "chunk length {} outside 1..={}",
                n, SAMPLE_HISTORY_LENGTH
            )));
        }
        self.samples.copy_within(n.., 0);
        self.samples[SAMPLE_HISTORY_LENGTH - n..].copy_from_slice(chunk);
        Ok(())
    }

    /// The most recent `len` samples ending one short of the buffer tail,
    /// matching how the resonators index their blocks.
    #[inline]
    pub fn tail(&self, len: usize) -> &[f32] {
        let end = SAMPLE_HISTORY_LENGTH - 1;
        &self.samples[end - len..end]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples[..]
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_shifts_left() {
        let mut h = SampleHistory::new();
        h.append_chunk(&[1.0; 64]).unwrap();
        h.append_chunk(&[2.0; 64]).unwrap();
        let s = h.as_slice();
        assert_eq!(s[SAMPLE_HISTORY_LENGTH - 1], 2.0);
        assert_eq!(s[SAMPLE_HISTORY_LENGTH - 64], 2.0);
        assert_eq!(s[SAMPLE_HISTORY_LENGTH - 65], 1.0);
        assert_eq!(s[SAMPLE_HISTORY_LENGTH - 128], 1.0);
        assert_eq!(s[0], 0.0);
    }

    #[test]
    fn tail_ends_one_short_of_buffer_end() {
        let mut h = SampleHistory::new();
        let chunk: Vec<f32> = (0..64).map(|i| i as f32).collect();
        h.append_chunk(&chunk).unwrap();
        let t = h.tail(64);
        // Tail window covers indices [4031, 4095), so the last chunk sample
        // (at 4095) is excluded and the window starts one chunk earlier.
        assert_eq!(t.len(), 64);
        assert_eq!(t[63], 62.0);
        assert_eq!(t[0], 0.0);
    }

    #[test]
    fn rejects_empty_and_oversized_chunks() {
        let mut h = SampleHistory::new();
        assert!(h.append_chunk(&[]).is_err());
        assert!(h.append_chunk(&vec![0.0; SAMPLE_HISTORY_LENGTH + 1]).is_err());
    }
}
