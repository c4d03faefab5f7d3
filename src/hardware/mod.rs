//! Hardware frame source abstraction.
//!
//! The digitizer exposes a DMA FIFO that is read with a blocking call bounded by a
//! timeout. Single-channel boards deliver 16-bit elements, four-channel boards deliver
//! 64-bit elements packing one 16-bit sample per channel. Both are driven through the
//! same [`FrameSource`] trait; the element width is selected by the multi-channel flag.

use std::time::Duration;

pub mod simulated;

pub use simulated::SimulatedFifo;

/// FIFO element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoWidth {
    /// One 16-bit sample per element (single channel)
    U16,
    /// Four packed 16-bit samples per element (multi-channel)
    U64,
}

impl FifoWidth {
    /// Bytes per element.
    pub fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U64 => 8,
        }
    }
}

/// Outcome of one FIFO read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `buffer` holds a complete frame.
    Success,
    /// No complete frame arrived within the timeout.
    Timeout,
    /// Non-timeout failure with a driver status code.
    Error(i32),
}

/// A blocking, timeout-bounded source of raw frames.
///
/// Implementations are moved onto the acquisition thread for the duration of a run and
/// handed back when the thread exits.
pub trait FrameSource: Send {
    /// Read `elements` FIFO elements into `buffer`, waiting at most `timeout`.
    ///
    /// `buffer` is at least `elements * element_width().bytes()` long.
    fn read(&mut self, buffer: &mut [u8], elements: usize, timeout: Duration) -> ReadStatus;

    /// Element width of this FIFO.
    fn element_width(&self) -> FifoWidth;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read(&mut self, buffer: &mut [u8], elements: usize, timeout: Duration) -> ReadStatus {
        (**self).read(buffer, elements, timeout)
    }

    fn element_width(&self) -> FifoWidth {
        (**self).element_width()
    }
}
