//! Disk logging: the frame sink abstraction, the frame file format and the logger thread.
//!
//! - [`FrameSink`]: an image file writer with a rewritable per-frame description.
//! - [`FrameFileWriter`] / [`FrameFileReader`]: the built-in sink and its reader.
//! - [`FrameLogger`]: drains the logging queue into a sink, averaging and rolling over files.

pub mod averaging;
pub mod frame_file;
pub mod logger;
pub mod note;

pub use averaging::Averager;
pub use frame_file::{FrameFileReader, FrameFileWriter, StoredFrame};
pub use logger::{FrameLogger, FRAME_TAG_TEXT_LEN, IMAGE_DESC_DEFAULT_PADDING};
pub use note::LogFileNote;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AcqResult};

/// How a log file is opened.
///
/// Parsed from a C-style mode string: the first character is `w` (truncate) or `a`
/// (append); any following characters must be `b`, `n`, `t` or `+` and are accepted
/// without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Create or truncate
    Write,
    /// Create or extend
    Append,
}

impl OpenMode {
    /// Parse a mode string such as `"wbn"` or `"ab"`.
    pub fn parse(mode: &str) -> AcqResult<Self> {
        let mut chars = mode.chars();
        let parsed = match chars.next() {
            Some('w') => Self::Write,
            Some('a') => Self::Append,
            _ => {
                return Err(AcqError::Configuration(format!(
                    "open mode '{mode}' must start with 'w' or 'a'"
                )))
            }
        };
        if let Some(bad) = chars.find(|c| !matches!(c, 'b' | 'n' | 't' | '+')) {
            return Err(AcqError::Configuration(format!(
                "open mode '{mode}' has unsupported flag '{bad}'"
            )));
        }
        Ok(parsed)
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Write => write!(f, "write"),
            OpenMode::Append => write!(f, "append"),
        }
    }
}

/// Shape of the images written to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    /// Image width; the transposed frame has one column per scan line
    pub width: u32,
    /// Image height
    pub height: u32,
    /// Bytes per sample
    pub bytes_per_pixel: u16,
    /// Channel planes per written frame
    pub channels: u16,
    /// Samples are two's complement
    pub signed: bool,
}

impl ImageLayout {
    /// Bytes of pixel data in one written frame.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize
            * self.height as usize
            * usize::from(self.bytes_per_pixel)
            * usize::from(self.channels)
    }
}

/// Destination for logged frames.
///
/// Every frame is written with the current image description. The description is fixed in
/// length once configured; the logger edits it in place between frames (frame tag) and on
/// rollover (header text).
pub trait FrameSink: Send {
    /// Set the image shape and the initial description for subsequent frames.
    fn configure_image(&mut self, layout: ImageLayout, description: &str) -> AcqResult<()>;

    /// Open `path`, closing nothing; the caller closes the previous file first.
    fn open(&mut self, path: &Path, mode: OpenMode) -> AcqResult<()>;

    /// True while a file is open.
    fn is_open(&self) -> bool;

    /// Append one frame of pixel data.
    fn write_frame(&mut self, data: &[u8]) -> AcqResult<()>;

    /// Overwrite description bytes starting at `offset` with `text`.
    fn modify_header_field(&mut self, offset: usize, text: &str) -> AcqResult<()>;

    /// Replace the whole description.
    fn replace_header(&mut self, text: &str) -> AcqResult<()>;

    /// Flush and close the current file.
    fn close(&mut self) -> AcqResult<()>;
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn configure_image(&mut self, layout: ImageLayout, description: &str) -> AcqResult<()> {
        (**self).configure_image(layout, description)
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> AcqResult<()> {
        (**self).open(path, mode)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn write_frame(&mut self, data: &[u8]) -> AcqResult<()> {
        (**self).write_frame(data)
    }

    fn modify_header_field(&mut self, offset: usize, text: &str) -> AcqResult<()> {
        (**self).modify_header_field(offset, text)
    }

    fn replace_header(&mut self, text: &str) -> AcqResult<()> {
        (**self).replace_header(text)
    }

    fn close(&mut self) -> AcqResult<()> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_parse() {
        assert_eq!(OpenMode::parse("wbn").unwrap(), OpenMode::Write);
        assert_eq!(OpenMode::parse("w").unwrap(), OpenMode::Write);
        assert_eq!(OpenMode::parse("ab+").unwrap(), OpenMode::Append);
        assert!(OpenMode::parse("").is_err());
        assert!(OpenMode::parse("r").is_err());
        assert!(OpenMode::parse("wx").is_err());
    }

    #[test]
    fn test_layout_frame_bytes() {
        let layout = ImageLayout {
            width: 4,
            height: 3,
            bytes_per_pixel: 2,
            channels: 2,
            signed: true,
        };
        assert_eq!(layout.frame_bytes(), 48);
    }
}
