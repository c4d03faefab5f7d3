//! Frame averaging for the logger.
//!
//! Sums are kept in `f64` so long runs of wide samples cannot overflow. The mean is
//! converted back with `as`, which truncates toward zero and saturates at the sample range.

/// Accumulates `factor` frames and produces their per-sample mean.
#[derive(Debug, Clone)]
pub struct Averager {
    factor: u32,
    pixel_size_bytes: usize,
    signed: bool,
    sums: Vec<f64>,
    result: Vec<u8>,
}

impl Averager {
    /// Averager for frames of `samples` samples, each `pixel_size_bytes` wide (1, 2 or 4).
    pub fn new(factor: u32, samples: usize, pixel_size_bytes: usize, signed: bool) -> Self {
        Self {
            factor: factor.max(1),
            pixel_size_bytes,
            signed,
            sums: vec![0.0; samples],
            result: vec![0; samples * pixel_size_bytes],
        }
    }

    /// Frames per average.
    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Bytes of one frame.
    pub fn frame_bytes(&self) -> usize {
        self.result.len()
    }

    /// Clear the running sums.
    pub fn zero(&mut self) {
        self.sums.fill(0.0);
    }

    /// Add one frame of little-endian samples.
    pub fn accumulate(&mut self, frame: &[u8]) {
        let width = self.pixel_size_bytes;
        let signed = self.signed;
        for (sum, sample) in self.sums.iter_mut().zip(frame.chunks_exact(width)) {
            *sum += decode_sample(sample, signed);
        }
    }

    /// Mean of the accumulated frames as little-endian samples.
    pub fn compute(&mut self) -> &[u8] {
        let factor = f64::from(self.factor);
        let width = self.pixel_size_bytes;
        for (sum, out) in self.sums.iter().zip(self.result.chunks_exact_mut(width)) {
            encode_sample(sum / factor, self.signed, out);
        }
        &self.result
    }
}

fn decode_sample(sample: &[u8], signed: bool) -> f64 {
    match (sample.len(), signed) {
        (1, true) => f64::from(sample[0] as i8),
        (1, false) => f64::from(sample[0]),
        (2, true) => f64::from(i16::from_le_bytes([sample[0], sample[1]])),
        (2, false) => f64::from(u16::from_le_bytes([sample[0], sample[1]])),
        (4, true) => f64::from(i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]])),
        (4, false) => f64::from(u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]])),
        _ => 0.0,
    }
}

fn encode_sample(mean: f64, signed: bool, out: &mut [u8]) {
    match (out.len(), signed) {
        (1, true) => out.copy_from_slice(&(mean as i8).to_le_bytes()),
        (1, false) => out.copy_from_slice(&(mean as u8).to_le_bytes()),
        (2, true) => out.copy_from_slice(&(mean as i16).to_le_bytes()),
        (2, false) => out.copy_from_slice(&(mean as u16).to_le_bytes()),
        (4, true) => out.copy_from_slice(&(mean as i32).to_le_bytes()),
        (4, false) => out.copy_from_slice(&(mean as u32).to_le_bytes()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_i16(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_constant_frames_average_to_value() {
        let mut avg = Averager::new(4, 3, 2, true);
        avg.zero();
        for _ in 0..4 {
            avg.accumulate(&frame_i16(&[-7, 100, 0]));
        }
        assert_eq!(avg.compute(), frame_i16(&[-7, 100, 0]).as_slice());
    }

    #[test]
    fn test_mean_truncates_toward_zero() {
        let mut avg = Averager::new(2, 2, 2, true);
        avg.accumulate(&frame_i16(&[1, -1]));
        avg.accumulate(&frame_i16(&[2, -2]));
        // 1.5 -> 1, -1.5 -> -1
        assert_eq!(avg.compute(), frame_i16(&[1, -1]).as_slice());
    }

    #[test]
    fn test_unsigned_wide_values_do_not_overflow() {
        let mut avg = Averager::new(2, 1, 2, false);
        avg.accumulate(&u16::MAX.to_le_bytes());
        avg.accumulate(&u16::MAX.to_le_bytes());
        assert_eq!(avg.compute(), u16::MAX.to_le_bytes().as_slice());
    }

    #[test]
    fn test_zero_resets_sums() {
        let mut avg = Averager::new(1, 1, 1, false);
        avg.accumulate(&[200]);
        avg.zero();
        avg.accumulate(&[10]);
        assert_eq!(avg.compute(), &[10]);
    }

    #[test]
    fn test_four_byte_samples() {
        let mut avg = Averager::new(2, 1, 4, true);
        avg.accumulate(&(-100_000i32).to_le_bytes());
        avg.accumulate(&(-100_002i32).to_le_bytes());
        assert_eq!(avg.compute(), (-100_001i32).to_le_bytes().as_slice());
    }
}
