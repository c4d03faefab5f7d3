//! Frame file format.
//!
//! A frame file is a small header followed by self-describing frame records. All integers
//! are little-endian.
//!
//! ```text
//! header:
//!   magic: u64            (0x52_53_43_4E_46_52_00_01)
//!   version: u16
//!   width: u32
//!   height: u32
//!   bytes_per_pixel: u16
//!   channels: u16
//!   signed: u8
//!   created_len: u16
//!   created: [u8; created_len]    RFC 3339 timestamp
//! frame record (repeated):
//!   description_len: u32
//!   description: [u8; description_len]
//!   data_len: u32
//!   data: [u8; data_len]
//! ```
//!
//! Every record carries its own copy of the image description, so edits made between
//! frames (frame tag text, rollover headers) are preserved per frame.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, Utc};

use crate::error::{AcqError, AcqResult};
use crate::storage::{FrameSink, ImageLayout, OpenMode};

const MAGIC: u64 = 0x52_53_43_4E_46_52_00_01;
const FORMAT_VERSION: u16 = 1;
// magic through created_len
const FIXED_HEADER_LEN: usize = 8 + 2 + 4 + 4 + 2 + 2 + 1 + 2;

fn encode_header(layout: &ImageLayout, created: DateTime<Utc>) -> BytesMut {
    let stamp = created.to_rfc3339();
    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + stamp.len());
    buf.put_u64_le(MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u32_le(layout.width);
    buf.put_u32_le(layout.height);
    buf.put_u16_le(layout.bytes_per_pixel);
    buf.put_u16_le(layout.channels);
    buf.put_u8(u8::from(layout.signed));
    buf.put_u16_le(stamp.len() as u16);
    buf.put_slice(stamp.as_bytes());
    buf
}

fn read_header<R: Read>(reader: &mut R) -> AcqResult<(ImageLayout, DateTime<FixedOffset>)> {
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    reader.read_exact(&mut fixed)?;
    let mut buf = &fixed[..];

    let magic = buf.get_u64_le();
    if magic != MAGIC {
        return Err(AcqError::Storage(format!(
            "Invalid frame file magic number: expected 0x{MAGIC:016X}, got 0x{magic:016X}"
        )));
    }
    let version = buf.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(AcqError::Storage(format!(
            "Unsupported frame file version {version}"
        )));
    }
    let layout = ImageLayout {
        width: buf.get_u32_le(),
        height: buf.get_u32_le(),
        bytes_per_pixel: buf.get_u16_le(),
        channels: buf.get_u16_le(),
        signed: buf.get_u8() != 0,
    };
    let stamp_len = usize::from(buf.get_u16_le());

    let mut stamp = vec![0u8; stamp_len];
    reader.read_exact(&mut stamp)?;
    let stamp = String::from_utf8(stamp)
        .map_err(|_| AcqError::Storage("frame file timestamp is not UTF-8".into()))?;
    let created = DateTime::parse_from_rfc3339(&stamp)
        .map_err(|e| AcqError::Storage(format!("bad frame file timestamp '{stamp}': {e}")))?;
    Ok((layout, created))
}

/// [`FrameSink`] writing the frame file format.
#[derive(Debug, Default)]
pub struct FrameFileWriter {
    layout: Option<ImageLayout>,
    description: Vec<u8>,
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    frames_written: u64,
}

impl FrameFileWriter {
    /// Writer with no image configured and no file open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the open file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Frames written to the current file.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Current description text.
    pub fn description(&self) -> String {
        String::from_utf8_lossy(&self.description).into_owned()
    }

    fn configured_layout(&self) -> AcqResult<ImageLayout> {
        self.layout
            .ok_or_else(|| AcqError::Storage("image layout not configured".into()))
    }
}

impl FrameSink for FrameFileWriter {
    fn configure_image(&mut self, layout: ImageLayout, description: &str) -> AcqResult<()> {
        if self.file.is_some() {
            return Err(AcqError::Storage(
                "cannot change the image layout while a file is open".into(),
            ));
        }
        self.layout = Some(layout);
        self.description = description.as_bytes().to_vec();
        Ok(())
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> AcqResult<()> {
        if self.file.is_some() {
            return Err(AcqError::Storage(format!(
                "cannot open {}: a file is already open",
                path.display()
            )));
        }
        let layout = self.configured_layout()?;

        let file = match mode {
            OpenMode::Write => {
                let mut file = File::create(path)?;
                file.write_all(&encode_header(&layout, Utc::now()))?;
                file
            }
            OpenMode::Append => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(path)?;
                if file.metadata()?.len() == 0 {
                    file.write_all(&encode_header(&layout, Utc::now()))?;
                } else {
                    let (existing, _) = read_header(&mut file)?;
                    if existing != layout {
                        return Err(AcqError::Storage(format!(
                            "cannot append to {}: it holds {}x{} images with {} channel(s)",
                            path.display(),
                            existing.width,
                            existing.height,
                            existing.channels
                        )));
                    }
                }
                file
            }
        };

        tracing::debug!(path = %path.display(), %mode, "Opened frame file");
        self.file = Some(BufWriter::new(file));
        self.path = Some(path.to_path_buf());
        self.frames_written = 0;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn write_frame(&mut self, data: &[u8]) -> AcqResult<()> {
        let expected = self.configured_layout()?.frame_bytes();
        if data.len() != expected {
            return Err(AcqError::RecordSize {
                expected,
                actual: data.len(),
            });
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AcqError::Storage("no frame file is open".into()))?;

        let mut prefix = BytesMut::with_capacity(8 + self.description.len());
        prefix.put_u32_le(self.description.len() as u32);
        prefix.put_slice(&self.description);
        prefix.put_u32_le(data.len() as u32);
        file.write_all(&prefix)?;
        file.write_all(data)?;

        self.frames_written += 1;
        Ok(())
    }

    fn modify_header_field(&mut self, offset: usize, text: &str) -> AcqResult<()> {
        let end = offset + text.len();
        if end > self.description.len() {
            return Err(AcqError::HeaderTooLong {
                len: end,
                capacity: self.description.len(),
            });
        }
        self.description[offset..end].copy_from_slice(text.as_bytes());
        Ok(())
    }

    fn replace_header(&mut self, text: &str) -> AcqResult<()> {
        self.description = text.as_bytes().to_vec();
        Ok(())
    }

    fn close(&mut self) -> AcqResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            tracing::debug!(
                path = ?self.path,
                frames = self.frames_written,
                "Closed frame file"
            );
        }
        self.path = None;
        Ok(())
    }
}

impl Drop for FrameFileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to flush frame file on drop");
        }
    }
}

/// One frame read back from a frame file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    /// Description written with the frame
    pub description: String,
    /// Pixel data
    pub data: Bytes,
}

/// Sequential reader for frame files.
#[derive(Debug)]
pub struct FrameFileReader {
    reader: BufReader<File>,
    layout: ImageLayout,
    created: DateTime<FixedOffset>,
}

impl FrameFileReader {
    /// Open `path` and read its header.
    pub fn open<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let (layout, created) = read_header(&mut reader)?;
        Ok(Self {
            reader,
            layout,
            created,
        })
    }

    /// Image layout recorded in the header.
    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Time the file was created.
    pub fn created(&self) -> DateTime<FixedOffset> {
        self.created
    }

    /// Next frame, or `None` at a clean end of file.
    pub fn next_frame(&mut self) -> AcqResult<Option<StoredFrame>> {
        let Some(desc_len) = self.read_record_start()? else {
            return Ok(None);
        };
        let mut description = vec![0u8; desc_len as usize];
        self.reader.read_exact(&mut description)?;
        let description = String::from_utf8(description)
            .map_err(|_| AcqError::Storage("frame description is not UTF-8".into()))?;

        let mut word = [0u8; 4];
        self.reader.read_exact(&mut word)?;
        let mut data = vec![0u8; u32::from_le_bytes(word) as usize];
        self.reader.read_exact(&mut data)?;

        Ok(Some(StoredFrame {
            description,
            data: Bytes::from(data),
        }))
    }

    /// Read every remaining frame.
    pub fn read_all(mut self) -> AcqResult<Vec<StoredFrame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn read_record_start(&mut self) -> io::Result<Option<u32>> {
        let mut word = [0u8; 4];
        let mut filled = 0;
        while filled < word.len() {
            match self.reader.read(&mut word[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated frame record",
                    ))
                }
                n => filled += n,
            }
        }
        Ok(Some(u32::from_le_bytes(word)))
    }
}
