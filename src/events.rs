//! One-way event channel from worker threads to the controller.
//!
//! Workers never change lifecycle state. When something goes wrong on the acquisition or
//! logging thread they post a [`WorkerEvent`] and leave their loop; the controller drains
//! the channel (see `ResonantScanner::poll_events`) and performs the transition itself.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

/// Something a worker thread needs the controller to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The frame source returned a non-timeout error; acquisition ended.
    FifoReadFailed {
        /// Driver status code
        code: i32,
    },
    /// A frame tag went backwards; acquisition ended.
    TagRegressed {
        /// Last accepted tag
        last: i64,
        /// Offending tag
        current: u64,
    },
    /// The logging thread aborted (file open/write failure, oversize header).
    LoggingAborted {
        /// Human-readable reason
        reason: String,
    },
}

/// Sending half, cloned into each worker.
#[derive(Debug, Clone)]
pub struct EventSender(Sender<WorkerEvent>);

impl EventSender {
    /// Post an event. Never blocks; an event is lost only if the controller is gone.
    pub fn post(&self, event: WorkerEvent) {
        if self.0.send(event).is_err() {
            tracing::debug!("Controller event receiver dropped; discarding worker event");
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn event_channel() -> (EventSender, Receiver<WorkerEvent>) {
    let (tx, rx) = unbounded();
    (EventSender(tx), rx)
}
