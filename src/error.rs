//! Custom error types for the acquisition pipeline.
//!
//! This module defines `AcqError`, the single error type returned by every fallible
//! operation in the library. Using the `thiserror` crate, it gives a consistent way to
//! report the problems that can occur while configuring, running and shutting down a scan.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: wraps `figment` errors raised while loading or extracting the
//!   configuration file and environment overrides.
//! - **`Configuration`**: semantic problems with values that parsed correctly but make no
//!   sense (zero-sized queues, unsupported pixel widths, empty channel selections).
//! - **`Io`**: wraps `std::io::Error` from the frame file writer and reader.
//! - **`InvalidState`**: a lifecycle method was called from a state that does not allow it.
//!   These correspond to programming errors in the controller.
//! - **`ArmFailed`**: one or more collaborators were missing or mismatched when a component
//!   was armed. The component state is left unchanged.
//! - **Queue errors** (`QueueEmpty`, `CheckoutOutstanding`, `RecordSize`): misuse of the
//!   single-reader/single-writer frame queue contract.
//! - **Logging errors** (`Storage`, `NoteOutOfOrder`, `HeaderTooLong`): problems applying
//!   rollover notes or writing frames.
//! - **Shutdown errors** (`StopTimeout`, `WorkerPanicked`, `ShutdownFailed`): a worker thread
//!   did not exit cleanly.

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Errors produced by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle method called from a state that does not permit it.
    #[error("{component} cannot {operation} while {state}")]
    InvalidState {
        /// Component name
        component: &'static str,
        /// Attempted operation
        operation: &'static str,
        /// State at the time of the call
        state: LifecycleState,
    },

    /// Arm preconditions were not met.
    #[error("{component} failed to arm: {}", reasons.join("; "))]
    ArmFailed {
        /// Component name
        component: &'static str,
        /// Every unmet precondition
        reasons: Vec<String>,
    },

    /// Pop or checkout on an empty queue.
    #[error("Frame queue '{0}' is empty")]
    QueueEmpty(String),

    /// A second checkout, or a pop, while a record is checked out.
    #[error("Frame queue '{0}' has a record checked out")]
    CheckoutOutstanding(String),

    /// A frame of the wrong size was offered to a queue or sink.
    #[error("Record of {actual} bytes does not match expected size {expected}")]
    RecordSize {
        /// Expected size in bytes
        expected: usize,
        /// Offered size in bytes
        actual: usize,
    },

    /// Frame sink failure that is not a plain I/O error.
    #[error("Frame file error: {0}")]
    Storage(String),

    /// Rollover notes must be added in strictly increasing frame order.
    #[error("Rollover note at frame {index} does not follow last queued note at frame {last}")]
    NoteOutOfOrder {
        /// Trigger index of the rejected note
        index: u64,
        /// Trigger index of the last queued note
        last: u64,
    },

    /// A replacement header does not fit into the space reserved at configuration.
    #[error("Header of {len} bytes exceeds the {capacity} bytes reserved for it")]
    HeaderTooLong {
        /// Length of the offered header
        len: usize,
        /// Space reserved when the image was configured
        capacity: usize,
    },

    /// A worker thread did not exit within its stop timeout.
    #[error("{0} worker did not stop in time")]
    StopTimeout(&'static str),

    /// A worker thread panicked.
    #[error("{0} worker thread panicked")]
    WorkerPanicked(&'static str),

    /// Several errors were collected while shutting down.
    #[error("Shutdown failed with errors: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ShutdownFailed(Vec<AcqError>),
}

impl AcqError {
    /// Build an `InvalidState` error.
    pub(crate) fn invalid_state(
        component: &'static str,
        operation: &'static str,
        state: LifecycleState,
    ) -> Self {
        Self::InvalidState {
            component,
            operation,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_failed_lists_every_reason() {
        let err = AcqError::ArmFailed {
            component: "FrameLogger",
            reasons: vec!["no input queue".into(), "no log file configured".into()],
        };
        assert_eq!(
            err.to_string(),
            "FrameLogger failed to arm: no input queue; no log file configured"
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let err = AcqError::invalid_state("FrameCopier", "disarm", LifecycleState::Running);
        assert_eq!(err.to_string(), "FrameCopier cannot disarm while RUNNING");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.rsf");
        let err: AcqError = io.into();
        assert!(matches!(err, AcqError::Io(_)));
        assert!(err.to_string().contains("missing.rsf"));
    }

    #[test]
    fn test_shutdown_failed_joins_messages() {
        let err = AcqError::ShutdownFailed(vec![
            AcqError::StopTimeout("FrameLogger"),
            AcqError::WorkerPanicked("FrameCopier"),
        ]);
        assert_eq!(
            err.to_string(),
            "Shutdown failed with errors: FrameLogger worker did not stop in time; FrameCopier worker thread panicked"
        );
    }
}
