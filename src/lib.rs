//! # Resonant Scan Acquisition Library
//!
//! This crate moves frames from the digitizer FIFO of a resonant line-scan microscope to
//! the display and to disk. Two worker threads do the work: an acquisition thread that
//! reshapes raw frames and fans them out into bounded frame queues, and a logging thread
//! that drains the logging queue into image files. A controller sequences both.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The `FrameCopier` acquisition thread (FIFO read, tag accounting,
//!   reshaping, channel routing, display decimation and notification).
//! - **`config`**: `ScanConfig`, loaded from TOML plus `RESONANT_ACQ_` environment
//!   overrides and shared read-only by every component.
//! - **`data`**: The single-producer/single-consumer `FrameQueue`, frame tags and the
//!   per-frame transforms.
//! - **`error`**: The `AcqError` enum used throughout the library.
//! - **`events`**: One-way `WorkerEvent` channel from worker threads to the controller.
//! - **`hardware`**: The `FrameSource` FIFO abstraction and a simulated FIFO.
//! - **`lifecycle`**: The CONSTRUCTED → ARMED → RUNNING ... state machine shared by the
//!   worker components.
//! - **`notify`**: Fire-and-forget "frame available" notification sinks.
//! - **`scanner`**: `ResonantScanner`, the controller owning queues and threads.
//! - **`storage`**: The `FrameSink` trait, the frame file format and the `FrameLogger`
//!   logging thread with averaging and file rollover.
//! - **`tracing_setup`**: Subscriber initialization for structured logging.
//! - **`worker`**: Named threads with bounded joins.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod hardware;
pub mod lifecycle;
pub mod notify;
pub mod scanner;
pub mod storage;
pub mod tracing_setup;
pub mod worker;

pub use error::{AcqError, AcqResult};
pub use scanner::{AcquiredFrame, ResonantScanner, ScannerStatus};
