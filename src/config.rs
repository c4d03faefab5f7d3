//! Scan configuration using Figment.
//!
//! `ScanConfig` is the explicit replacement for a process-wide parameter store: the
//! controller loads it once, wraps it in an `Arc` and hands it to the copier and logger,
//! which only read it. Configuration is loaded from:
//! 1. a TOML file (`config/resonant_acq.toml` by default)
//! 2. environment variables prefixed with `RESONANT_ACQ_`, using `__` between section and key
//!
//! Every field has a default, so an empty file yields a usable single-channel setup.
//!
//! # Example
//! ```no_run
//! use resonant_acq::config::ScanConfig;
//!
//! // RESONANT_ACQ_GEOMETRY__LINES_PER_FRAME=256 overrides the file value
//! let config = ScanConfig::load_from("config/resonant_acq.toml")?;
//! config.validate()?;
//! println!("{} bytes per frame", config.geometry().frame_bytes());
//! # Ok::<(), resonant_acq::error::AcqError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::data::{ChannelSelection, FrameGeometry};
use crate::error::{AcqError, AcqResult};
use crate::storage::OpenMode;

/// Top-level scan configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Frame geometry and sample format
    pub geometry: GeometryConfig,
    /// Channel routing and offsets
    pub channels: ChannelConfig,
    /// Acquisition thread and queue settings
    pub acquisition: AcquisitionConfig,
    /// Disk logging settings
    pub logging: LoggingConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Frame geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Pixels along one scan line
    pub pixels_per_line: usize,
    /// Lines per frame
    pub lines_per_frame: usize,
    /// Four-channel interleaved FIFO instead of single channel
    pub multi_channel: bool,
    /// Frames carry a trailing hardware tag
    pub frame_tagging: bool,
    /// Bytes per logged sample
    pub pixel_size_bytes: usize,
    /// Samples are signed
    pub signed_data: bool,
}

/// Channel routing. Empty vectors mean "every channel".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channels delivered to the display queue
    pub display: Vec<bool>,
    /// Channels delivered to the logging queue
    pub logging: Vec<bool>,
    /// Per-channel offsets; 0 disables correction for that channel
    pub offsets: Vec<i16>,
    /// Apply offset subtraction at all
    pub subtract_offsets: bool,
}

/// Acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Records per frame queue
    pub queue_capacity: usize,
    /// Every k-th frame reaches the display queue; 0 is ignored
    pub decimation_factor: u32,
    /// Identifier passed to notification sinks
    pub source_id: u32,
    /// FIFO read timeout in milliseconds
    pub frame_wait_timeout_ms: u64,
    /// Bound on each blocking stop, in milliseconds
    pub stop_timeout_ms: u64,
    /// Frame period of the simulated FIFO, in milliseconds
    pub simulated_frame_interval_ms: u64,
}

/// Disk logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log frames to disk during acquisition
    pub enabled: bool,
    /// First output file
    pub file_name: PathBuf,
    /// C-style open mode, e.g. "wbn" or "ab"
    pub open_mode: String,
    /// Image description written with every frame
    pub header: String,
    /// Frames averaged into each written frame
    pub average_factor: u32,
    /// Frames held back in the queue before logging
    pub frame_delay: usize,
    /// Hardware tags are reported one-based
    pub frame_tag_one_based: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            pixels_per_line: 512,
            lines_per_frame: 512,
            multi_channel: false,
            frame_tagging: true,
            pixel_size_bytes: 2,
            signed_data: true,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            decimation_factor: 1,
            source_id: 0,
            frame_wait_timeout_ms: 250,
            stop_timeout_ms: 5000,
            simulated_frame_interval_ms: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_name: PathBuf::from("default_file.rsf"),
            open_mode: "wbn".to_string(),
            header: "Default header str".to_string(),
            average_factor: 1,
            frame_delay: 0,
            frame_tag_one_based: true,
        }
    }
}

impl ScanConfig {
    /// Load configuration from `config/resonant_acq.toml` and environment variables.
    pub fn load() -> AcqResult<Self> {
        Self::load_from("config/resonant_acq.toml")
    }

    /// Load configuration from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        Ok(Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RESONANT_ACQ_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AcqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AcqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.geometry().validate()?;

        if self.acquisition.queue_capacity == 0 {
            return Err(AcqError::Configuration(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.logging.frame_delay >= self.acquisition.queue_capacity {
            return Err(AcqError::Configuration(format!(
                "frame_delay {} must be less than queue_capacity {}",
                self.logging.frame_delay, self.acquisition.queue_capacity
            )));
        }
        if self.logging.average_factor == 0 {
            return Err(AcqError::Configuration(
                "average_factor must be at least 1".into(),
            ));
        }

        let channels = self.channel_count();
        for (name, selection) in [
            ("display", &self.channels.display),
            ("logging", &self.channels.logging),
        ] {
            if !selection.is_empty() && selection.len() != channels {
                return Err(AcqError::Configuration(format!(
                    "{name} channel selection has {} entries but frames carry {channels} channel(s)",
                    selection.len()
                )));
            }
        }
        if self.channels.offsets.len() > channels {
            return Err(AcqError::Configuration(format!(
                "{} channel offsets given for {channels} channel(s)",
                self.channels.offsets.len()
            )));
        }
        self.display_channels()?;
        self.logging_channels()?;

        OpenMode::parse(&self.logging.open_mode)?;
        Ok(())
    }

    /// Hardware channel count (4 for multi-channel, else 1).
    pub fn channel_count(&self) -> usize {
        if self.geometry.multi_channel {
            4
        } else {
            1
        }
    }

    /// Derived frame geometry.
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            pixels_per_line: self.geometry.pixels_per_line,
            lines_per_frame: self.geometry.lines_per_frame,
            channels: self.channel_count(),
            pixel_size_bytes: self.geometry.pixel_size_bytes,
            signed: self.geometry.signed_data,
            tagging: self.geometry.frame_tagging,
        }
    }

    fn selection(&self, flags: &[bool]) -> AcqResult<ChannelSelection> {
        if flags.is_empty() {
            Ok(ChannelSelection::all(self.channel_count()))
        } else {
            ChannelSelection::new(flags.to_vec())
        }
    }

    /// Channels routed to the display queue.
    pub fn display_channels(&self) -> AcqResult<ChannelSelection> {
        self.selection(&self.channels.display)
    }

    /// Channels routed to the logging queue.
    pub fn logging_channels(&self) -> AcqResult<ChannelSelection> {
        self.selection(&self.channels.logging)
    }

    /// Offsets to subtract per hardware channel, or `None` when subtraction is off.
    pub fn channel_offsets(&self) -> Option<Vec<i16>> {
        if !self.channels.subtract_offsets {
            return None;
        }
        let mut offsets = self.channels.offsets.clone();
        offsets.resize(self.channel_count(), 0);
        Some(offsets)
    }

    /// FIFO read timeout.
    pub fn frame_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.frame_wait_timeout_ms)
    }

    /// Bound on each blocking stop.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.stop_timeout_ms)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AcqResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AcqError::Configuration(format!("cannot render configuration: {e}")))
    }
}
