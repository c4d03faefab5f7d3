//! Simulated FIFO for running the pipeline without a digitizer.
//!
//! Produces frames at a fixed interval with:
//! - a per-channel horizontal gradient (`sample = pixel + 256 * channel`)
//! - a zero-based hardware tag counting every frame produced
//!
//! Optional limits make it useful in tests: stop producing after N frames (reads then time
//! out) or fail with a driver error code after N frames.

use std::thread;
use std::time::{Duration, Instant};

use crate::data::tag::encode_tag_block;
use crate::data::FrameGeometry;
use crate::hardware::{FifoWidth, FrameSource, ReadStatus};

/// Status code reported when the caller's buffer cannot hold a frame.
pub const BUFFER_TOO_SMALL: i32 = -52005;

/// Simulated digitizer FIFO.
#[derive(Debug)]
pub struct SimulatedFifo {
    geometry: FrameGeometry,
    interval: Duration,
    next_due: Instant,
    produced: u64,
    frame_limit: Option<u64>,
    error_after: Option<(u64, i32)>,
}

impl SimulatedFifo {
    /// Source producing frames of `geometry` every `interval`.
    pub fn new(geometry: FrameGeometry, interval: Duration) -> Self {
        Self {
            geometry,
            interval,
            next_due: Instant::now(),
            produced: 0,
            frame_limit: None,
            error_after: None,
        }
    }

    /// Stop producing after `frames`; later reads time out.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Fail with `code` once `frames` frames have been produced.
    pub fn with_error_after(mut self, frames: u64, code: i32) -> Self {
        self.error_after = Some((frames, code));
        self
    }

    /// Frames produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.produced
    }

    fn fill(&self, buffer: &mut [u8]) {
        let g = &self.geometry;
        for l in 0..g.lines_per_frame {
            for p in 0..g.pixels_per_line {
                for c in 0..g.channels {
                    let sample = (p + 256 * c) as i16;
                    let idx = ((l * g.pixels_per_line + p) * g.channels + c) * 2;
                    buffer[idx..idx + 2].copy_from_slice(&sample.to_le_bytes());
                }
            }
        }
        if g.tagging {
            let at = g.data_bytes();
            buffer[at..at + g.tag_bytes()].copy_from_slice(&encode_tag_block(self.produced));
        }
    }
}

impl FrameSource for SimulatedFifo {
    fn read(&mut self, buffer: &mut [u8], elements: usize, timeout: Duration) -> ReadStatus {
        if buffer.len() < elements * self.element_width().bytes()
            || buffer.len() < self.geometry.frame_bytes()
        {
            return ReadStatus::Error(BUFFER_TOO_SMALL);
        }
        if let Some((after, code)) = self.error_after {
            if self.produced >= after {
                return ReadStatus::Error(code);
            }
        }
        if self.frame_limit.is_some_and(|limit| self.produced >= limit) {
            thread::sleep(timeout);
            return ReadStatus::Timeout;
        }

        let now = Instant::now();
        if self.next_due > now + timeout {
            thread::sleep(timeout);
            return ReadStatus::Timeout;
        }
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }

        self.fill(buffer);
        self.produced += 1;
        self.next_due = self.next_due.max(now) + self.interval;
        ReadStatus::Success
    }

    fn element_width(&self) -> FifoWidth {
        self.geometry.fifo_width()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tag::decode_tag_block;

    fn geometry(channels: usize) -> FrameGeometry {
        FrameGeometry {
            pixels_per_line: 3,
            lines_per_frame: 2,
            channels,
            pixel_size_bytes: 2,
            signed: true,
            tagging: true,
        }
    }

    fn read_one(fifo: &mut SimulatedFifo) -> (ReadStatus, Vec<u8>) {
        let g = fifo.geometry;
        let mut buf = vec![0u8; g.fifo_elements() * g.fifo_width().bytes()];
        let status = fifo.read(&mut buf, g.fifo_elements(), Duration::from_millis(250));
        (status, buf)
    }

    #[test]
    fn test_multichannel_gradient_and_tag() {
        let mut fifo = SimulatedFifo::new(geometry(4), Duration::ZERO);
        let (status, buf) = read_one(&mut fifo);
        assert_eq!(status, ReadStatus::Success);
        // line 1, pixel 2, channel 3
        let idx = ((3 + 2) * 4 + 3) * 2;
        assert_eq!(i16::from_le_bytes([buf[idx], buf[idx + 1]]), 2 + 768);
        assert_eq!(decode_tag_block(&buf[48..]), Some(0));

        let (_, buf) = read_one(&mut fifo);
        assert_eq!(decode_tag_block(&buf[48..]), Some(1));
    }

    #[test]
    fn test_frame_limit_times_out() {
        let mut fifo = SimulatedFifo::new(geometry(1), Duration::ZERO).with_frame_limit(1);
        assert_eq!(read_one(&mut fifo).0, ReadStatus::Success);
        let g = fifo.geometry;
        let mut buf = vec![0u8; g.frame_bytes()];
        assert_eq!(
            fifo.read(&mut buf, g.fifo_elements(), Duration::from_millis(5)),
            ReadStatus::Timeout
        );
    }

    #[test]
    fn test_injected_error() {
        let mut fifo = SimulatedFifo::new(geometry(1), Duration::ZERO).with_error_after(1, -61);
        assert_eq!(read_one(&mut fifo).0, ReadStatus::Success);
        assert_eq!(read_one(&mut fifo).0, ReadStatus::Error(-61));
    }

    #[test]
    fn test_slow_frames_time_out_first() {
        let mut fifo = SimulatedFifo::new(geometry(1), Duration::from_secs(10));
        assert_eq!(read_one(&mut fifo).0, ReadStatus::Success);
        let g = fifo.geometry;
        let mut buf = vec![0u8; g.frame_bytes()];
        assert_eq!(
            fifo.read(&mut buf, g.fifo_elements(), Duration::from_millis(5)),
            ReadStatus::Timeout
        );
    }
}
