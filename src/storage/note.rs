//! Rollover notes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Instruction to switch log files before a given frame.
///
/// `frame_index` is one-based: a note at index `n` takes effect immediately before the
/// `n`-th logged frame is written, so the first file of a run is a note at index 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileNote {
    /// File to open
    pub file_name: PathBuf,
    /// Mode string, e.g. "wbn"
    pub open_mode: String,
    /// Logged-frame count (one-based) at which to switch
    pub frame_index: u64,
    /// Replacement header applied after opening
    pub header: Option<String>,
}

impl LogFileNote {
    /// Note switching to `file_name` before frame `frame_index`, keeping the header.
    pub fn new(
        file_name: impl Into<PathBuf>,
        open_mode: impl Into<String>,
        frame_index: u64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            open_mode: open_mode.into(),
            frame_index,
            header: None,
        }
    }

    /// Also replace the header text when switching.
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }
}
