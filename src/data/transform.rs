//! Per-frame reshaping: de-interlace, transpose, channel filtering and offset subtraction.
//!
//! All functions operate on little-endian byte buffers and are parameterized by a
//! [`FrameGeometry`]. The hardware delivers each frame line by line; multi-channel FIFOs
//! interleave the four channel samples of every pixel:
//!
//! ```text
//! raw (multi-channel):  p0c0 p0c1 p0c2 p0c3 p1c0 p1c1 ... | tag block
//! de-interlaced:        c0[p0 p1 ...] c1[p0 p1 ...] c2[...] c3[...]
//! transposed plane:     dst[p * lines + l] = src[l * pixels_per_line + p]
//! ```
//!
//! The tag block is never part of the reshaped pixel data; callers append it afterwards.

use crate::data::tag::{encode_tag_block, TAG_SIZE_BYTES};
use crate::error::{AcqError, AcqResult};
use crate::hardware::FifoWidth;

/// Frame dimensions and sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Pixels along one scan line
    pub pixels_per_line: usize,
    /// Lines in one frame
    pub lines_per_frame: usize,
    /// Channels carried by the hardware frame (1 or 4)
    pub channels: usize,
    /// Bytes per sample
    pub pixel_size_bytes: usize,
    /// Samples are two's complement
    pub signed: bool,
    /// Frames carry a trailing tag block
    pub tagging: bool,
}

impl FrameGeometry {
    /// Pixels in one channel plane.
    pub fn frame_pixels(&self) -> usize {
        self.pixels_per_line * self.lines_per_frame
    }

    /// Bytes in one channel plane.
    pub fn channel_bytes(&self) -> usize {
        self.frame_pixels() * self.pixel_size_bytes
    }

    /// Bytes of pixel data for all hardware channels.
    pub fn data_bytes(&self) -> usize {
        self.channel_bytes() * self.channels
    }

    /// Bytes of trailing tag (0 when untagged).
    pub fn tag_bytes(&self) -> usize {
        if self.tagging {
            TAG_SIZE_BYTES
        } else {
            0
        }
    }

    /// Bytes of a full frame including the tag.
    pub fn frame_bytes(&self) -> usize {
        self.data_bytes() + self.tag_bytes()
    }

    /// Bytes of a queued record carrying `active_channels` planes plus the tag.
    pub fn record_bytes(&self, active_channels: usize) -> usize {
        self.channel_bytes() * active_channels + self.tag_bytes()
    }

    /// True for the four-channel interleaved hardware mode.
    pub fn is_multi_channel(&self) -> bool {
        self.channels > 1
    }

    /// FIFO element width selected by the channel mode.
    pub fn fifo_width(&self) -> FifoWidth {
        if self.is_multi_channel() {
            FifoWidth::U64
        } else {
            FifoWidth::U16
        }
    }

    /// FIFO elements making up one frame, tag included.
    pub fn fifo_elements(&self) -> usize {
        self.frame_bytes().div_ceil(self.fifo_width().bytes())
    }

    /// Check the geometry can be processed by the acquisition path.
    pub fn validate(&self) -> AcqResult<()> {
        if self.pixels_per_line == 0 || self.lines_per_frame == 0 {
            return Err(AcqError::Configuration(
                "pixels_per_line and lines_per_frame must be non-zero".into(),
            ));
        }
        if !matches!(self.channels, 1 | 4) {
            return Err(AcqError::Configuration(format!(
                "hardware frames carry 1 or 4 channels, not {}",
                self.channels
            )));
        }
        if !matches!(self.pixel_size_bytes, 1 | 2 | 4) {
            return Err(AcqError::Configuration(format!(
                "pixel_size_bytes must be 1, 2 or 4, not {}",
                self.pixel_size_bytes
            )));
        }
        Ok(())
    }
}

/// Which channels a consumer wants, in hardware channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSelection {
    active: Vec<bool>,
}

impl ChannelSelection {
    /// Selection from an explicit per-channel flag vector.
    pub fn new(active: Vec<bool>) -> AcqResult<Self> {
        if !active.iter().any(|&a| a) {
            return Err(AcqError::Configuration(
                "channel selection must include at least one channel".into(),
            ));
        }
        Ok(Self { active })
    }

    /// Every one of `channels` channels.
    pub fn all(channels: usize) -> Self {
        Self {
            active: vec![true; channels],
        }
    }

    /// Number of channels the selection covers.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True when the selection covers no channels at all.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of active channels.
    pub fn count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// Whether channel `c` is active.
    pub fn is_active(&self, c: usize) -> bool {
        self.active.get(c).copied().unwrap_or(false)
    }

    /// Index of the first active channel.
    pub fn first(&self) -> Option<usize> {
        self.active.iter().position(|&a| a)
    }

    /// True when the active channels form one unbroken run (e.g. 1-3, not 1,3,4).
    pub fn is_contiguous(&self) -> bool {
        match (self.first(), self.active.iter().rposition(|&a| a)) {
            (Some(first), Some(last)) => self.active[first..=last].iter().all(|&a| a),
            _ => false,
        }
    }

    /// Indices of the active channels in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(c, &a)| a.then_some(c))
    }
}

/// Split interleaved samples into contiguous channel planes.
///
/// `dst[c * frame_pixels + i] = src[channels * i + c]`, sample-wise.
pub fn deinterlace(
    src: &[u8],
    dst: &mut [u8],
    frame_pixels: usize,
    channels: usize,
    sample_bytes: usize,
) {
    for i in 0..frame_pixels {
        for c in 0..channels {
            let s = (i * channels + c) * sample_bytes;
            let d = (c * frame_pixels + i) * sample_bytes;
            dst[d..d + sample_bytes].copy_from_slice(&src[s..s + sample_bytes]);
        }
    }
}

/// Remap one line-major plane to pixel-major order.
pub fn transpose_plane(
    src: &[u8],
    dst: &mut [u8],
    pixels_per_line: usize,
    lines_per_frame: usize,
    sample_bytes: usize,
) {
    for p in 0..pixels_per_line {
        for l in 0..lines_per_frame {
            let d = (p * lines_per_frame + l) * sample_bytes;
            let s = (l * pixels_per_line + p) * sample_bytes;
            dst[d..d + sample_bytes].copy_from_slice(&src[s..s + sample_bytes]);
        }
    }
}

/// Reshapes raw hardware frames into transposed channel planes, reusing scratch storage.
#[derive(Debug)]
pub struct FrameReshaper {
    geometry: FrameGeometry,
    planes: Vec<u8>,
}

impl FrameReshaper {
    /// Reshaper for frames of `geometry`.
    pub fn new(geometry: FrameGeometry) -> Self {
        let planes = if geometry.is_multi_channel() {
            vec![0; geometry.data_bytes()]
        } else {
            Vec::new()
        };
        Self { geometry, planes }
    }

    /// Geometry this reshaper was built for.
    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// De-interlace (multi-channel only) and transpose the pixel data of `raw` into
    /// `out[..data_bytes]`. The tag region of `out` is left untouched.
    pub fn reshape(&mut self, raw: &[u8], out: &mut [u8]) {
        let g = self.geometry;
        let sb = g.pixel_size_bytes;
        let plane = g.channel_bytes();

        let source: &[u8] = if g.is_multi_channel() {
            deinterlace(raw, &mut self.planes, g.frame_pixels(), g.channels, sb);
            &self.planes
        } else {
            raw
        };

        for c in 0..g.channels {
            let range = c * plane..(c + 1) * plane;
            transpose_plane(
                &source[range.clone()],
                &mut out[range],
                g.pixels_per_line,
                g.lines_per_frame,
                sb,
            );
        }
    }
}

/// Copy the planes chosen by `selection` from `frame` into `dst` and append the tag block
/// when `tag` is given. Returns the number of bytes written.
///
/// A selection covering every channel passes the planes through untouched; a contiguous
/// run is copied in one piece; anything else is copied plane by plane in channel order.
pub fn filter_channels(
    frame: &[u8],
    dst: &mut [u8],
    selection: &ChannelSelection,
    channel_bytes: usize,
    tag: Option<u64>,
) -> usize {
    let active = selection.count();
    let data_len = active * channel_bytes;

    if active == selection.len() {
        dst[..data_len].copy_from_slice(&frame[..data_len]);
    } else if selection.is_contiguous() {
        let first = selection.first().unwrap_or(0);
        let start = first * channel_bytes;
        dst[..data_len].copy_from_slice(&frame[start..start + data_len]);
    } else {
        for (k, c) in selection.indices().enumerate() {
            dst[k * channel_bytes..(k + 1) * channel_bytes]
                .copy_from_slice(&frame[c * channel_bytes..(c + 1) * channel_bytes]);
        }
    }

    match tag {
        Some(tag) => {
            dst[data_len..data_len + TAG_SIZE_BYTES].copy_from_slice(&encode_tag_block(tag));
            data_len + TAG_SIZE_BYTES
        }
        None => data_len,
    }
}

/// Subtract each active channel's 16-bit offset from every sample of its plane in `buf`.
///
/// `buf` holds the filtered planes (active channels only, in order). Offsets are indexed by
/// hardware channel; a zero offset means "no correction" and the plane is skipped.
/// Arithmetic wraps, as the hardware samples do.
pub fn subtract_offsets(
    buf: &mut [u8],
    selection: &ChannelSelection,
    offsets: &[i16],
    channel_bytes: usize,
    signed: bool,
) {
    for (k, c) in selection.indices().enumerate() {
        let offset = offsets.get(c).copied().unwrap_or(0);
        if offset == 0 {
            continue;
        }
        tracing::trace!(channel = c, offset, "Subtracting channel offset");

        let plane = &mut buf[k * channel_bytes..(k + 1) * channel_bytes];
        for sample in plane.chunks_exact_mut(2) {
            let raw = [sample[0], sample[1]];
            let corrected = if signed {
                i16::from_le_bytes(raw).wrapping_sub(offset).to_le_bytes()
            } else {
                u16::from_le_bytes(raw)
                    .wrapping_sub(offset as u16)
                    .to_le_bytes()
            };
            sample.copy_from_slice(&corrected);
        }
    }
}
