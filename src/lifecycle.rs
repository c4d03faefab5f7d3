//! Component lifecycle shared by `FrameCopier` and `FrameLogger`.
//!
//! ```text
//! CONSTRUCTED --arm--> ARMED --start--> RUNNING <--pause/resume--> PAUSED
//!      ^                                   |                          |
//!      +--------disarm------ STOPPED <-----+---------stop-------------+
//!
//! any state --kill--> KILLED (terminal)
//! ```
//!
//! Only the controller thread drives these transitions. Worker threads report problems
//! through [`crate::events::WorkerEvent`] and never touch the state directly.

use std::fmt;

use serde::Serialize;

use crate::error::{AcqError, AcqResult};

/// Lifecycle state of a pipeline component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Freshly built or disarmed; wiring may change.
    Constructed,
    /// Collaborators validated; ready to start.
    Armed,
    /// Worker thread active and processing.
    Running,
    /// Worker thread alive but inert.
    Paused,
    /// Worker thread joined; may restart or disarm.
    Stopped,
    /// Unusable. A fresh instance must be constructed.
    Killed,
}

impl LifecycleState {
    /// Return `Ok` when `self` is one of `allowed`, otherwise an `InvalidState` error
    /// naming the component and operation.
    pub fn require(
        self,
        component: &'static str,
        operation: &'static str,
        allowed: &[LifecycleState],
    ) -> AcqResult<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(AcqError::invalid_state(component, operation, self))
        }
    }

    /// True while a worker thread may be alive.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Constructed => "CONSTRUCTED",
            Self::Armed => "ARMED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Killed => "KILLED",
        };
        f.write_str(name)
    }
}
