//! Frame tags and the seen/missed accounting built on them.
//!
//! When tagging is enabled the digitizer appends four 16-bit words to every frame:
//!
//! ```text
//! [ identifier = -32768 | placeholder = 0 | count high | count low ]
//! ```
//!
//! The tag value is `high * 65536 + low`, a zero-based count of records the FPGA has
//! produced. The same 8-byte block is carried at the tail of every queued record.

use serde::Serialize;

/// First word of every tag block.
pub const TAG_IDENTIFIER: i16 = i16::MIN;

/// Size of a tag block in bytes.
pub const TAG_SIZE_BYTES: usize = 8;

/// Build a tag block holding `tag`. Values above `u32::MAX` wrap.
pub fn encode_tag_block(tag: u64) -> [u8; TAG_SIZE_BYTES] {
    let value = tag as u32;
    let high = (value >> 16) as u16;
    let low = (value & 0xFFFF) as u16;

    let mut block = [0u8; TAG_SIZE_BYTES];
    block[0..2].copy_from_slice(&TAG_IDENTIFIER.to_le_bytes());
    block[2..4].copy_from_slice(&0u16.to_le_bytes());
    block[4..6].copy_from_slice(&high.to_le_bytes());
    block[6..8].copy_from_slice(&low.to_le_bytes());
    block
}

/// Read the tag value from the first [`TAG_SIZE_BYTES`] of `block`.
///
/// Returns `None` when the block is short or does not start with [`TAG_IDENTIFIER`].
pub fn decode_tag_block(block: &[u8]) -> Option<u64> {
    let block = block.get(..TAG_SIZE_BYTES)?;
    if i16::from_le_bytes([block[0], block[1]]) != TAG_IDENTIFIER {
        return None;
    }
    let high = u16::from_le_bytes([block[4], block[5]]);
    let low = u16::from_le_bytes([block[6], block[7]]);
    Some(u64::from(high) * 65536 + u64::from(low))
}

/// Convert a hardware (zero-based) tag to the logical tag used downstream.
pub fn logical_tag(hardware_tag: u64, one_based: bool) -> u64 {
    if one_based {
        hardware_tag + 1
    } else {
        hardware_tag
    }
}

/// Result of feeding one tag to [`FrameCounters::observe_tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStep {
    /// A new frame; `missed` tags were skipped since the previous one.
    Advanced {
        /// Gap size, zero when consecutive
        missed: u64,
    },
    /// Same tag as the last frame; nothing new arrived.
    Duplicate,
    /// Tag went backwards. Counters are untouched.
    Regressed {
        /// Last accepted tag
        last: i64,
    },
}

/// Per-run frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounters {
    /// Frames received (tagged mode: distinct advancing tags).
    pub frames_seen: u64,
    /// Frames the hardware produced that never arrived.
    pub frames_missed: u64,
    /// Last tag accepted, or the run baseline before the first frame.
    pub last_tag: i64,
}

impl FrameCounters {
    /// Fresh counters for a run whose first logical tag is 1 (one-based) or 0.
    pub fn new(one_based: bool) -> Self {
        let mut counters = Self::default();
        counters.reset(one_based);
        counters
    }

    /// Zero the counters and set the tag baseline just below the first expected tag.
    pub fn reset(&mut self, one_based: bool) {
        self.frames_seen = 0;
        self.frames_missed = 0;
        self.last_tag = if one_based { 0 } else { -1 };
    }

    /// Account for a tagged frame.
    pub fn observe_tag(&mut self, tag: u64) -> TagStep {
        let tag = tag as i64;
        let delta = tag - self.last_tag;
        if delta < 0 {
            return TagStep::Regressed {
                last: self.last_tag,
            };
        }
        if delta == 0 {
            return TagStep::Duplicate;
        }

        let missed = (delta - 1) as u64;
        self.frames_seen += 1;
        self.frames_missed += missed;
        self.last_tag = tag;
        TagStep::Advanced { missed }
    }

    /// Account for an untagged frame.
    pub fn observe_untagged(&mut self) {
        self.frames_seen += 1;
    }
}
