//! Scanner controller.
//!
//! `ResonantScanner` owns the two frame queues, the acquisition thread ([`FrameCopier`])
//! and the logging thread ([`FrameLogger`]) and sequences them:
//!
//! ```text
//! FrameSource ──▶ FrameCopier ──▶ display queue (drop-oldest) ──▶ get_frame()
//!                              └─▶ logging queue (reject-newest) ──▶ FrameLogger ──▶ FrameSink
//! ```
//!
//! Worker threads never change lifecycle state on their own. They post a
//! [`WorkerEvent`], and [`ResonantScanner::poll_events`] performs the transition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use serde::Serialize;
use tracing::{info, warn};

use crate::acquisition::FrameCopier;
use crate::config::ScanConfig;
use crate::data::tag::decode_tag_block;
use crate::data::{FrameCounters, FrameQueue, OverflowPolicy};
use crate::error::{AcqError, AcqResult};
use crate::events::{event_channel, WorkerEvent};
use crate::hardware::FrameSource;
use crate::lifecycle::LifecycleState;
use crate::notify::{NotificationSink, NullNotifier};
use crate::storage::{FrameLogger, FrameSink, LogFileNote};

/// One display frame, split into channel planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredFrame {
    /// Hardware channel index of each plane
    pub channels: Vec<usize>,
    /// Transposed pixel data, one plane per selected channel
    pub planes: Vec<Bytes>,
    /// Logical frame tag, when tagging is enabled
    pub tag: Option<u64>,
}

/// Serializable snapshot of the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    /// Acquisition thread state
    pub acquisition: LifecycleState,
    /// Logging thread state
    pub logging: LifecycleState,
    /// Seen/missed counters of the current run
    pub counters: FrameCounters,
    /// Display frames waiting to be read
    pub frames_available: usize,
    /// Display frames overwritten or rejected
    pub dropped_display_frames: u64,
    /// Logging frames rejected because the logger fell behind
    pub dropped_log_frames: u64,
    /// Frames consumed by the logger
    pub frames_logged: u64,
    /// Display decimation factor
    pub decimation_factor: u32,
}

/// Controller for one resonant scanner.
pub struct ResonantScanner {
    config: Arc<ScanConfig>,
    display_queue: Arc<FrameQueue>,
    logging_queue: Arc<FrameQueue>,
    copier: FrameCopier,
    logger: FrameLogger,
    events: Receiver<WorkerEvent>,
    log_file: (PathBuf, String),
    logging_active: bool,
}

impl ResonantScanner {
    /// Build a scanner reading `source` and logging through `sink`.
    pub fn new(
        config: Arc<ScanConfig>,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> AcqResult<Self> {
        config.validate()?;
        let (display_queue, logging_queue) =
            Self::build_queues(&config, config.acquisition.queue_capacity)?;
        let (events_tx, events) = event_channel();

        let mut copier = FrameCopier::new(Arc::clone(&config));
        copier.configure_source(source)?;
        copier.set_display_queue(Arc::clone(&display_queue))?;
        copier.set_output_queues(vec![Arc::clone(&logging_queue)])?;
        copier.configure_callback(Arc::new(NullNotifier), config.acquisition.source_id)?;
        copier.set_event_sender(events_tx.clone());

        let mut logger = FrameLogger::new(Arc::clone(&config), sink);
        logger.set_input_queue(Arc::clone(&logging_queue))?;
        logger.set_event_sender(events_tx);
        logger.configure_image(config.logging.average_factor, &config.logging.header)?;
        logger.configure_file(&config.logging.file_name, &config.logging.open_mode)?;

        let log_file = (
            config.logging.file_name.clone(),
            config.logging.open_mode.clone(),
        );
        let mut scanner = Self {
            config,
            display_queue,
            logging_queue,
            copier,
            logger,
            events,
            log_file,
            logging_active: false,
        };
        scanner.set_decimation_factor(scanner.config.acquisition.decimation_factor);
        Ok(scanner)
    }

    fn build_queues(
        config: &ScanConfig,
        capacity: usize,
    ) -> AcqResult<(Arc<FrameQueue>, Arc<FrameQueue>)> {
        let geometry = config.geometry();
        let display = FrameQueue::new(
            "display",
            geometry.record_bytes(config.display_channels()?.count()),
            capacity,
            OverflowPolicy::DropOldest,
        )?;
        let logging = FrameQueue::new(
            "logging",
            geometry.record_bytes(config.logging_channels()?.count()),
            capacity,
            OverflowPolicy::RejectNewest,
        )?;
        Ok((Arc::new(display), Arc::new(logging)))
    }

    fn ensure_idle(&self, operation: &'static str) -> AcqResult<()> {
        if self.copier.state().is_active() {
            return Err(AcqError::invalid_state(
                "ResonantScanner",
                operation,
                self.copier.state(),
            ));
        }
        if self.logger.is_logging() {
            return Err(AcqError::invalid_state(
                "ResonantScanner",
                operation,
                self.logger.state(),
            ));
        }
        Ok(())
    }

    /// Reallocate both frame queues with `capacity` records each.
    pub fn configure_buffers(&mut self, capacity: usize) -> AcqResult<()> {
        self.ensure_idle("configure buffers")?;
        if capacity <= self.config.logging.frame_delay {
            return Err(AcqError::Configuration(format!(
                "queue capacity {capacity} must exceed frame_delay {}",
                self.config.logging.frame_delay
            )));
        }
        let (display, logging) = Self::build_queues(&self.config, capacity)?;
        self.copier.disarm()?;
        self.copier.set_display_queue(Arc::clone(&display))?;
        self.copier.set_output_queues(vec![Arc::clone(&logging)])?;
        self.logger.disarm()?;
        self.logger.set_input_queue(Arc::clone(&logging))?;
        self.display_queue = display;
        self.logging_queue = logging;
        info!(capacity, "Frame queues reallocated");
        Ok(())
    }

    /// Set the first log file, its header and the averaging factor.
    pub fn configure_log_file(
        &mut self,
        file_name: impl AsRef<Path>,
        open_mode: &str,
        header: &str,
        average_factor: u32,
    ) -> AcqResult<()> {
        self.ensure_idle("configure log file")?;
        self.logger.disarm()?;
        self.logger.configure_image(average_factor, header)?;
        self.logger.configure_file(file_name.as_ref(), open_mode)?;
        self.log_file = (file_name.as_ref().to_path_buf(), open_mode.to_string());
        Ok(())
    }

    /// Route frame notifications to `sink`, or disable them with `None`.
    pub fn configure_callback(
        &mut self,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> AcqResult<()> {
        self.ensure_idle("configure callback")?;
        let source_id = self.config.acquisition.source_id;
        match sink {
            Some(sink) => {
                self.copier.configure_callback(sink, source_id)?;
                self.copier.set_callback_enabled(true);
            }
            None => {
                self.copier
                    .configure_callback(Arc::new(NullNotifier), source_id)?;
                self.copier.set_callback_enabled(false);
            }
        }
        Ok(())
    }

    /// Push every `factor`-th frame to the display queue. Zero is ignored.
    pub fn set_decimation_factor(&mut self, factor: u32) {
        if factor == 0 {
            warn!("Ignoring display decimation factor of 0");
            return;
        }
        self.copier.set_decimation_factor(factor);
    }

    /// Arm the acquisition thread, and the logger when logging is enabled.
    ///
    /// A component stopped after a previous run is already startable and is left alone.
    pub fn arm(&mut self) -> AcqResult<()> {
        if self.copier.state() != LifecycleState::Stopped {
            self.copier.arm()?;
        }
        if self.config.logging.enabled && self.logger.state() != LifecycleState::Stopped {
            self.logger.arm()?;
        }
        Ok(())
    }

    /// Return both threads to CONSTRUCTED.
    pub fn disarm(&mut self) -> AcqResult<()> {
        self.ensure_idle("disarm")?;
        self.copier.disarm()?;
        self.logger.disarm()
    }

    /// Start acquiring. With `allow_logging` the logger is started first and the logging
    /// queue is fed.
    pub fn start_acquisition(&mut self, allow_logging: bool) -> AcqResult<()> {
        self.ensure_idle("start acquisition")?;
        self.display_queue.reinit();
        self.logging_queue.reinit();

        if allow_logging {
            let (file, mode) = self.log_file.clone();
            self.logger.ensure_first_file(file, &mode)?;
            if self.logger.state() == LifecycleState::Constructed {
                self.logger.arm()?;
            }
            self.logger.start_logging()?;
        }

        if let Err(e) = self.copier.start_processing(&[allow_logging]) {
            if allow_logging {
                if let Err(stop) = self.logger.stop_logging() {
                    warn!(error = %stop, "Failed to stop logger after acquisition start failed");
                }
            }
            return Err(e);
        }
        self.logging_active = allow_logging;
        info!(logging = allow_logging, "Acquisition started");
        Ok(())
    }

    /// Stop acquiring, then let the logger drain the logging queue.
    pub fn stop_acquisition(&mut self) -> AcqResult<()> {
        let mut errors = Vec::new();
        if self.copier.state().is_active() {
            if let Err(e) = self.copier.stop_processing() {
                errors.push(e);
            }
        }
        info!(
            frames_seen = self.frames_seen(),
            frames_missed = self.frames_missed(),
            dropped_display = self.dropped_display_frames(),
            dropped_log = self.dropped_log_frames(),
            "Acquisition statistics"
        );

        if self.logging_active {
            if let Err(e) = self.logger.stop_logging() {
                errors.push(e);
            }
            self.logging_active = false;
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(AcqError::ShutdownFailed(errors)),
        }
    }

    /// Keep the FIFO drained but stop producing frames.
    pub fn pause_acquisition(&mut self) -> AcqResult<()> {
        self.copier.pause_processing()
    }

    /// Resume producing frames with fresh counters.
    pub fn resume_acquisition(&mut self) -> AcqResult<()> {
        self.copier.resume_processing()
    }

    /// Queue a log file rollover.
    pub fn add_rollover_note(&self, note: LogFileNote) -> AcqResult<()> {
        self.logger.add_rollover_note(note)
    }

    /// Take the oldest display frame, or `None` when none is waiting.
    pub fn get_frame(&self) -> AcqResult<Option<AcquiredFrame>> {
        if self.display_queue.is_empty() {
            return Ok(None);
        }
        let geometry = self.config.geometry();
        let selection = self.config.display_channels()?;
        let plane = geometry.channel_bytes();

        let record = self.display_queue.front_checkout()?;
        let channels: Vec<usize> = selection.indices().collect();
        let planes = (0..channels.len())
            .map(|k| Bytes::copy_from_slice(&record[k * plane..(k + 1) * plane]))
            .collect();
        let tag = if geometry.tagging {
            decode_tag_block(&record[channels.len() * plane..])
        } else {
            None
        };
        record.checkin();
        self.display_queue.pop()?;

        Ok(Some(AcquiredFrame {
            channels,
            planes,
            tag,
        }))
    }

    /// Handle events posted by the worker threads and return them.
    pub fn poll_events(&mut self) -> Vec<WorkerEvent> {
        let events: Vec<WorkerEvent> = self.events.try_iter().collect();
        for event in &events {
            match event {
                WorkerEvent::FifoReadFailed { .. } | WorkerEvent::TagRegressed { .. } => {
                    warn!(?event, "Acquisition thread ended; stopping acquisition");
                    if let Err(e) = self.stop_acquisition() {
                        warn!(error = %e, "Failed to stop acquisition");
                    }
                }
                WorkerEvent::LoggingAborted { reason } => {
                    warn!(reason = %reason, "Logging aborted; stopping logger");
                    if self.logger.is_logging() {
                        if let Err(e) = self.logger.stop_logging() {
                            warn!(error = %e, "Failed to stop logger");
                        }
                    }
                    self.logging_active = false;
                }
            }
        }
        events
    }

    /// Stop everything that is running.
    pub fn shutdown(&mut self) -> AcqResult<()> {
        if self.copier.state().is_active() || self.logging_active {
            self.stop_acquisition()?;
        }
        Ok(())
    }

    /// Scan configuration.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Acquisition thread state.
    pub fn acquisition_state(&self) -> LifecycleState {
        self.copier.state()
    }

    /// Logging thread state.
    pub fn logging_state(&self) -> LifecycleState {
        self.logger.state()
    }

    /// Records each frame queue holds.
    pub fn queue_capacity(&self) -> usize {
        self.display_queue.capacity()
    }

    /// Display frames waiting to be read.
    pub fn frames_available(&self) -> usize {
        self.display_queue.len()
    }

    /// Frames seen in the current run.
    pub fn frames_seen(&self) -> u64 {
        self.copier.frames_seen()
    }

    /// Frames the hardware produced that never arrived.
    pub fn frames_missed(&self) -> u64 {
        self.copier.frames_missed()
    }

    /// Display frames overwritten or rejected.
    pub fn dropped_display_frames(&self) -> u64 {
        self.display_queue.num_dropped_push_back()
    }

    /// Logging frames rejected.
    pub fn dropped_log_frames(&self) -> u64 {
        self.logging_queue.num_dropped_push_back()
    }

    /// Frames consumed by the logger.
    pub fn frames_logged(&self) -> u64 {
        self.logger.frames_logged()
    }

    /// Snapshot of counters and states.
    pub fn status(&self) -> ScannerStatus {
        ScannerStatus {
            acquisition: self.copier.state(),
            logging: self.logger.state(),
            counters: self.copier.counters(),
            frames_available: self.frames_available(),
            dropped_display_frames: self.dropped_display_frames(),
            dropped_log_frames: self.dropped_log_frames(),
            frames_logged: self.frames_logged(),
            decimation_factor: self.copier.decimation_factor(),
        }
    }

    /// Multi-line summary of every component.
    pub fn debug_string(&self) -> String {
        format!(
            "ResonantScanner\n  {}\n  {}\n  {}\n  {}",
            self.copier.debug_string(),
            self.logger.debug_string(),
            self.display_queue.debug_string(),
            self.logging_queue.debug_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedFifo;
    use crate::storage::FrameFileWriter;
    use std::time::Duration;

    fn scanner(config: ScanConfig) -> ResonantScanner {
        let config = Arc::new(config);
        let source = SimulatedFifo::new(config.geometry(), Duration::from_millis(1));
        ResonantScanner::new(config, Box::new(source), Box::new(FrameFileWriter::new())).unwrap()
    }

    fn small_config() -> ScanConfig {
        let mut config = ScanConfig::default();
        config.geometry.pixels_per_line = 8;
        config.geometry.lines_per_frame = 4;
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = small_config();
        config.acquisition.queue_capacity = 0;
        let config = Arc::new(config);
        let source = SimulatedFifo::new(config.geometry(), Duration::ZERO);
        assert!(ResonantScanner::new(config, Box::new(source), Box::new(FrameFileWriter::new()))
            .is_err());
    }

    #[test]
    fn test_zero_decimation_is_ignored() {
        let mut config = small_config();
        config.acquisition.decimation_factor = 3;
        let mut scanner = scanner(config);
        scanner.set_decimation_factor(0);
        assert_eq!(scanner.status().decimation_factor, 3);
    }

    #[test]
    fn test_get_frame_on_empty_queue() {
        let scanner = scanner(small_config());
        assert_eq!(scanner.get_frame().unwrap(), None);
        assert_eq!(scanner.frames_available(), 0);
    }

    #[test]
    fn test_configure_buffers_resizes_queues() {
        let mut scanner = scanner(small_config());
        scanner.configure_buffers(3).unwrap();
        assert_eq!(scanner.queue_capacity(), 3);
        scanner.arm().unwrap();
        assert_eq!(scanner.acquisition_state(), LifecycleState::Armed);
    }

    #[test]
    fn test_status_serializes() {
        let scanner = scanner(small_config());
        let json = serde_json::to_value(scanner.status()).unwrap();
        assert_eq!(json["acquisition"], "CONSTRUCTED");
        assert_eq!(json["frames_logged"], 0);
    }
}
