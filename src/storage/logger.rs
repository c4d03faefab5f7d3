//! Frame logger: drains the logging queue into a [`FrameSink`] on a dedicated thread.
//!
//! Each loop iteration of the logging thread:
//! 1. exits on kill, or on halt once the queue is empty;
//! 2. services at most one rollover note (stale notes are discarded with a warning, a note
//!    due at the next frame closes the current file and opens the next);
//! 3. logs the front record once more than `frame_delay` records are queued (or on halt),
//!    either directly or through the [`Averager`];
//! 4. otherwise waits briefly for the queue to fill.
//!
//! When tagging is enabled the image description starts with a fixed-width frame tag
//! line that is rewritten before every write, and is padded so later headers can be
//! swapped in without changing its length.
//!
//! Any sink error aborts the thread: the file is closed, a
//! [`WorkerEvent::LoggingAborted`] is posted and later stop calls succeed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ScanConfig;
use crate::data::tag::decode_tag_block;
use crate::data::FrameQueue;
use crate::error::{AcqError, AcqResult};
use crate::events::{EventSender, WorkerEvent};
use crate::lifecycle::LifecycleState;
use crate::storage::{Averager, FrameSink, ImageLayout, LogFileNote, OpenMode};
use crate::worker::{JoinOutcome, Worker};

/// Length of the frame tag line at the start of tagged descriptions.
pub const FRAME_TAG_TEXT_LEN: usize = 29;

/// Spaces appended to tagged descriptions to leave room for longer rollover headers.
pub const IMAGE_DESC_DEFAULT_PADDING: usize = 256;

const COMPONENT: &str = "FrameLogger";
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Frame tag line written at the start of tagged descriptions.
pub fn frame_tag_text(tag: u64) -> String {
    format!("Frame Tag = {tag:>16}\n")
}

// =============================================================================
// Shared state
// =============================================================================

#[derive(Debug, Default)]
struct LoggerShared {
    notes: Mutex<VecDeque<LogFileNote>>,
    halt: AtomicBool,
    kill: AtomicBool,
    frames_logged: AtomicU64,
}

/// Collaborators handed back by the thread when it exits.
struct LoggerParts {
    sink: Box<dyn FrameSink>,
    averager: Option<Averager>,
}

/// Everything the logging thread owns while running.
struct LoggingRun {
    sink: Box<dyn FrameSink>,
    averager: Option<Averager>,
    shared: Arc<LoggerShared>,
    events: Option<EventSender>,
    data_bytes: usize,
    tagging: bool,
    frame_delay: usize,
    configured_desc_len: usize,
}

impl LoggingRun {
    fn run(mut self, queue: Arc<FrameQueue>) -> LoggerParts {
        info!(queue = queue.name(), "Logging thread started");
        loop {
            if self.shared.kill.load(Ordering::Acquire) {
                debug!("Logging thread killed");
                break;
            }
            let halting = self.shared.halt.load(Ordering::Acquire);
            if halting && queue.is_empty() {
                debug!("Logging thread halted with empty queue");
                break;
            }

            if let Err(e) = self.service_note() {
                self.abort(&e);
                break;
            }

            let ready = queue.len() > self.frame_delay || (halting && !queue.is_empty());
            if ready {
                if let Err(e) = self.log_front(&queue) {
                    self.abort(&e);
                    break;
                }
            } else {
                queue.wait_for_len(self.frame_delay + 1, IDLE_WAIT);
            }
        }

        if self.sink.is_open() {
            if let Err(e) = self.sink.close() {
                warn!(error = %e, "Failed to close log file");
            }
        }
        info!(
            frames_logged = self.shared.frames_logged.load(Ordering::Acquire),
            "Logging thread exiting"
        );
        LoggerParts {
            sink: self.sink,
            averager: self.averager,
        }
    }

    fn abort(&self, e: &AcqError) {
        error!(error = %e, "Aborting logging");
        if let Some(events) = &self.events {
            events.post(WorkerEvent::LoggingAborted {
                reason: e.to_string(),
            });
        }
    }

    /// Apply or discard the first pending note.
    fn service_note(&mut self) -> AcqResult<()> {
        let next_frame = self.shared.frames_logged.load(Ordering::Acquire) + 1;
        let note = {
            let mut notes = self.shared.notes.lock();
            match notes.front() {
                Some(note) if note.frame_index < next_frame => {
                    warn!(
                        file = %note.file_name.display(),
                        frame_index = note.frame_index,
                        next_frame,
                        "Rollover note arrived too late; discarding"
                    );
                    notes.pop_front();
                    return Ok(());
                }
                Some(note) if note.frame_index == next_frame => notes.pop_front(),
                _ => None,
            }
        };

        match note {
            Some(note) => self.roll_over(&note),
            None => Ok(()),
        }
    }

    fn roll_over(&mut self, note: &LogFileNote) -> AcqResult<()> {
        info!(
            file = %note.file_name.display(),
            frame_index = note.frame_index,
            "Rolling over log file"
        );
        if self.sink.is_open() {
            self.sink.close()?;
        }
        let mode = OpenMode::parse(&note.open_mode)?;
        self.sink.open(&note.file_name, mode)?;

        match note.header.as_deref() {
            Some(header) if !header.is_empty() => {
                if self.tagging {
                    let capacity = self.configured_desc_len - FRAME_TAG_TEXT_LEN;
                    if header.len() > capacity {
                        return Err(AcqError::HeaderTooLong {
                            len: header.len(),
                            capacity,
                        });
                    }
                    let mut padded = header.to_owned();
                    padded.extend(std::iter::repeat(' ').take(capacity - header.len()));
                    self.sink.modify_header_field(FRAME_TAG_TEXT_LEN, &padded)
                } else {
                    self.sink.replace_header(header)
                }
            }
            _ => Ok(()),
        }
    }

    fn update_frame_tag(sink: &mut dyn FrameSink, tag: u64) -> AcqResult<()> {
        let text = frame_tag_text(tag);
        if text.len() != FRAME_TAG_TEXT_LEN {
            return Err(AcqError::Storage(format!(
                "frame tag text '{}' is {} characters, expected {FRAME_TAG_TEXT_LEN}",
                text.trim_end(),
                text.len()
            )));
        }
        sink.modify_header_field(0, &text)
    }

    /// Log the front record, then release and pop it.
    fn log_front(&mut self, queue: &FrameQueue) -> AcqResult<()> {
        let frames_logged = self.shared.frames_logged.load(Ordering::Acquire);
        let record = queue.front_checkout()?;
        let pixels = &record[..self.data_bytes];
        let tag = if self.tagging {
            decode_tag_block(&record[self.data_bytes..])
        } else {
            None
        };

        match self.averager.as_mut() {
            None => {
                if let Some(tag) = tag {
                    Self::update_frame_tag(self.sink.as_mut(), tag)?;
                }
                self.sink.write_frame(pixels)?;
                record.checkin();
            }
            Some(averager) => {
                let factor = u64::from(averager.factor());
                let position = frames_logged % factor;
                if position == 0 {
                    averager.zero();
                }
                averager.accumulate(pixels);
                record.checkin();

                if position + 1 == factor {
                    if let Some(tag) = tag {
                        Self::update_frame_tag(self.sink.as_mut(), tag)?;
                    }
                    self.sink.write_frame(averager.compute())?;
                }
            }
        }

        queue.pop()?;
        self.shared
            .frames_logged
            .store(frames_logged + 1, Ordering::Release);
        Ok(())
    }
}

// =============================================================================
// FrameLogger
// =============================================================================

/// Controller-side handle for the logging thread.
pub struct FrameLogger {
    config: Arc<ScanConfig>,
    state: LifecycleState,
    sink: Option<Box<dyn FrameSink>>,
    averager: Option<Averager>,
    average_factor: u32,
    configured_desc_len: usize,
    image_configured: bool,
    queue: Option<Arc<FrameQueue>>,
    events: Option<EventSender>,
    shared: Arc<LoggerShared>,
    worker: Option<Worker<LoggerParts>>,
}

impl FrameLogger {
    /// Logger writing through `sink`, configured from `config`.
    pub fn new(config: Arc<ScanConfig>, sink: Box<dyn FrameSink>) -> Self {
        Self {
            config,
            state: LifecycleState::Constructed,
            sink: Some(sink),
            averager: None,
            average_factor: 1,
            configured_desc_len: 0,
            image_configured: false,
            queue: None,
            events: None,
            shared: Arc::new(LoggerShared::default()),
            worker: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// True while the logging thread is running.
    pub fn is_logging(&self) -> bool {
        self.state == LifecycleState::Running
    }

    /// Frames consumed from the queue since logging started.
    pub fn frames_logged(&self) -> u64 {
        self.shared.frames_logged.load(Ordering::Acquire)
    }

    /// Rollover notes not yet applied.
    pub fn pending_notes(&self) -> Vec<LogFileNote> {
        self.shared.notes.lock().iter().cloned().collect()
    }

    /// Set the queue drained by the logging thread.
    pub fn set_input_queue(&mut self, queue: Arc<FrameQueue>) -> AcqResult<()> {
        self.state
            .require(COMPONENT, "set input queue", &[LifecycleState::Constructed])?;
        self.queue = Some(queue);
        Ok(())
    }

    /// Report thread aborts on `events`.
    pub fn set_event_sender(&mut self, events: EventSender) {
        self.events = Some(events);
    }

    /// Configure the image shape, averaging factor and header for subsequent files.
    pub fn configure_image(&mut self, average_factor: u32, header: &str) -> AcqResult<()> {
        self.state
            .require(COMPONENT, "configure image", &[LifecycleState::Constructed])?;
        if average_factor == 0 {
            return Err(AcqError::Configuration(
                "average factor must be at least 1".into(),
            ));
        }
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| AcqError::Storage("frame sink is not available".into()))?;

        let geometry = self.config.geometry();
        let channels = self.config.logging_channels()?.count();
        let description = if geometry.tagging {
            let mut text = frame_tag_text(0);
            text.push_str(header);
            text.push_str(&" ".repeat(IMAGE_DESC_DEFAULT_PADDING));
            text
        } else {
            header.to_string()
        };

        let layout = ImageLayout {
            width: geometry.pixels_per_line as u32,
            height: geometry.lines_per_frame as u32,
            bytes_per_pixel: geometry.pixel_size_bytes as u16,
            channels: channels as u16,
            signed: geometry.signed,
        };
        sink.configure_image(layout, &description)?;
        self.configured_desc_len = description.len();

        self.average_factor = average_factor;
        self.averager = (average_factor > 1).then(|| {
            Averager::new(
                average_factor,
                geometry.frame_pixels() * channels,
                geometry.pixel_size_bytes,
                geometry.signed,
            )
        });
        self.image_configured = true;
        debug!(
            average_factor,
            description_len = self.configured_desc_len,
            "Configured log image"
        );
        Ok(())
    }

    /// Set the first log file. Clears pending notes and queues a note at frame 1.
    pub fn configure_file(
        &mut self,
        file_name: impl Into<std::path::PathBuf>,
        mode: &str,
    ) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "configure file",
            &[LifecycleState::Constructed, LifecycleState::Stopped],
        )?;
        OpenMode::parse(mode)?;
        let mut notes = self.shared.notes.lock();
        notes.clear();
        notes.push_back(LogFileNote::new(file_name, mode, 1));
        Ok(())
    }

    /// Make `file_name` the file opened at frame 1 unless a note already covers it.
    ///
    /// Rollover notes queued since the last run are kept behind it.
    pub fn ensure_first_file(
        &mut self,
        file_name: impl Into<std::path::PathBuf>,
        mode: &str,
    ) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "ensure first file",
            &[LifecycleState::Constructed, LifecycleState::Armed, LifecycleState::Stopped],
        )?;
        OpenMode::parse(mode)?;
        let mut notes = self.shared.notes.lock();
        if notes.front().map(|n| n.frame_index) != Some(1) {
            notes.push_front(LogFileNote::new(file_name, mode, 1));
        }
        Ok(())
    }

    /// Queue a rollover. Indices must increase strictly.
    pub fn add_rollover_note(&self, note: LogFileNote) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "add rollover note",
            &[
                LifecycleState::Armed,
                LifecycleState::Running,
                LifecycleState::Stopped,
            ],
        )?;
        OpenMode::parse(&note.open_mode)?;
        let mut notes = self.shared.notes.lock();
        if let Some(last) = notes.back() {
            if note.frame_index <= last.frame_index {
                return Err(AcqError::NoteOutOfOrder {
                    index: note.frame_index,
                    last: last.frame_index,
                });
            }
        }
        debug!(
            file = %note.file_name.display(),
            frame_index = note.frame_index,
            "Queued rollover note"
        );
        notes.push_back(note);
        Ok(())
    }

    /// Unmet preconditions. Rollover notes queued after arming are allowed when `starting`.
    fn arm_failures(&self, starting: bool) -> Vec<String> {
        let mut reasons = Vec::new();
        match &self.queue {
            None => reasons.push("no logging queue".to_string()),
            Some(queue) => {
                let geometry = self.config.geometry();
                match self.config.logging_channels() {
                    Ok(selection) => {
                        let expected = geometry.record_bytes(selection.count());
                        if queue.record_size() != expected {
                            reasons.push(format!(
                                "logging queue records are {} bytes, expected {expected}",
                                queue.record_size()
                            ));
                        }
                    }
                    Err(e) => reasons.push(e.to_string()),
                }
            }
        }
        if self.sink.is_none() {
            reasons.push("no frame sink".to_string());
        }
        if !self.image_configured {
            reasons.push("image not configured".to_string());
        } else if self.average_factor > 1 && self.averager.is_none() {
            reasons.push("averaging buffers not allocated".to_string());
        }
        let notes = self.shared.notes.lock();
        let first_at_one = notes.front().map(|n| n.frame_index) == Some(1);
        if !first_at_one || (!starting && notes.len() != 1) {
            reasons.push("log file not configured (expected one note at frame 1)".to_string());
        }
        reasons
    }

    /// Check every precondition for logging.
    pub fn arm(&mut self) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "arm",
            &[LifecycleState::Constructed, LifecycleState::Armed],
        )?;
        let reasons = self.arm_failures(false);
        if !reasons.is_empty() {
            return Err(AcqError::ArmFailed {
                component: COMPONENT,
                reasons,
            });
        }
        self.state = LifecycleState::Armed;
        Ok(())
    }

    /// Return to CONSTRUCTED so the logger can be reconfigured.
    pub fn disarm(&mut self) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "disarm",
            &[
                LifecycleState::Constructed,
                LifecycleState::Armed,
                LifecycleState::Stopped,
            ],
        )?;
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Start the logging thread.
    pub fn start_logging(&mut self) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "start logging",
            &[LifecycleState::Armed, LifecycleState::Stopped],
        )?;
        let reasons = self.arm_failures(true);
        if !reasons.is_empty() {
            return Err(AcqError::ArmFailed {
                component: COMPONENT,
                reasons,
            });
        }
        let geometry = self.config.geometry();
        let channels = self.config.logging_channels()?.count();
        let Some(queue) = self.queue.clone() else {
            return Err(AcqError::Storage("logging queue missing".into()));
        };
        let Some(sink) = self.sink.take() else {
            return Err(AcqError::Storage("frame sink missing".into()));
        };
        if !queue.is_empty() {
            warn!(
                queue = queue.name(),
                len = queue.len(),
                "Logging queue not empty at start"
            );
        }

        self.shared.halt.store(false, Ordering::Release);
        self.shared.kill.store(false, Ordering::Release);
        self.shared.frames_logged.store(0, Ordering::Release);
        if let Some(averager) = self.averager.as_mut() {
            averager.zero();
        }

        let run = LoggingRun {
            sink,
            averager: self.averager.take(),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            data_bytes: geometry.channel_bytes() * channels,
            tagging: geometry.tagging,
            frame_delay: self.config.logging.frame_delay,
            configured_desc_len: self.configured_desc_len,
        };
        match Worker::spawn("frame-logger", move || run.run(queue)) {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                error!(error = %e, "Failed to spawn logging thread");
                return Err(e);
            }
        }
        self.state = LifecycleState::Running;
        info!("Logging started");
        Ok(())
    }

    fn wait_for_thread(&mut self) -> AcqResult<bool> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(true);
        };
        match worker.join_timeout(self.config.stop_timeout()) {
            Ok(JoinOutcome::Finished(parts)) => {
                self.sink = Some(parts.sink);
                self.averager = parts.averager;
                self.worker = None;
                Ok(true)
            }
            Ok(JoinOutcome::TimedOut) => Ok(false),
            Err(e) => {
                self.worker = None;
                self.sink = None;
                self.state = LifecycleState::Killed;
                Err(e)
            }
        }
    }

    /// Let the thread drain the queue and exit. Escalates to
    /// [`stop_logging_immediately`](Self::stop_logging_immediately) on timeout.
    pub fn stop_logging(&mut self) -> AcqResult<()> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        self.state
            .require(COMPONENT, "stop logging", &[LifecycleState::Running])?;

        self.shared.halt.store(true, Ordering::Release);
        self.wake_queue();
        if self.wait_for_thread()? {
            self.state = LifecycleState::Stopped;
            info!(frames_logged = self.frames_logged(), "Logging stopped");
            return Ok(());
        }

        warn!(
            timeout = ?self.config.stop_timeout(),
            "Logging thread did not drain in time; stopping immediately"
        );
        self.stop_logging_immediately()
    }

    /// Stop without draining. Moves to KILLED if the thread still does not exit.
    pub fn stop_logging_immediately(&mut self) -> AcqResult<()> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        self.state.require(
            COMPONENT,
            "stop logging immediately",
            &[LifecycleState::Running],
        )?;

        self.shared.kill.store(true, Ordering::Release);
        self.wake_queue();
        if self.wait_for_thread()? {
            self.state = LifecycleState::Stopped;
            let unlogged = self.queue.as_ref().map_or(0, |q| q.len());
            if unlogged > 0 {
                warn!(unlogged, "Logging stopped with frames left in the queue");
            }
            return Ok(());
        }

        error!("Logging thread did not respond to kill; abandoning it");
        self.kill();
        Err(AcqError::StopTimeout(COMPONENT))
    }

    /// Signal the thread to exit and abandon it.
    pub fn kill(&mut self) {
        self.shared.kill.store(true, Ordering::Release);
        self.wake_queue();
        if let Some(worker) = self.worker.take() {
            worker.detach();
        }
        self.state = LifecycleState::Killed;
    }

    fn wake_queue(&self) {
        if let Some(queue) = &self.queue {
            queue.wake_waiters();
        }
    }

    /// One-line summary of the logger state.
    pub fn debug_string(&self) -> String {
        format!(
            "FrameLogger {{ state: {}, frames_logged: {}, average_factor: {}, pending_notes: {}, queue: {} }}",
            self.state,
            self.frames_logged(),
            self.average_factor,
            self.shared.notes.lock().len(),
            self.queue
                .as_ref()
                .map_or_else(|| "none".to_string(), |q| q.debug_string()),
        )
    }
}

impl Drop for FrameLogger {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.kill();
        }
    }
}
