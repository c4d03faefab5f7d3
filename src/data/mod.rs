//! Frame data handling: the bounded frame queue, per-frame transforms and frame tags.
pub mod frame_queue;
pub mod tag;
pub mod transform;

pub use frame_queue::{FrameQueue, FrontGuard, OverflowPolicy};
pub use tag::{FrameCounters, TagStep};
pub use transform::{ChannelSelection, FrameGeometry, FrameReshaper};
