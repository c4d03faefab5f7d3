//! Acquisition: the thread moving frames from the FIFO into the frame queues.
pub mod copier;

pub use copier::FrameCopier;
