//! Frame copier: the acquisition thread between the FIFO and the frame queues.
//!
//! Per frame the thread:
//! 1. reads one raw frame from the [`FrameSource`], bounded by the frame wait timeout;
//! 2. accounts for the frame tag (duplicates are skipped, a regression ends the run);
//! 3. reshapes the pixel data into transposed channel planes;
//! 4. every `decimation`-th frame, filters the display channels, pushes them to the
//!    display queue and notifies the callback sink;
//! 5. filters the logging channels and pushes them to each enabled output queue.
//!
//! Counters and the processing flag sit behind one mutex taken once per frame, so pause
//! and resume from the controller are serialized with frame processing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::ScanConfig;
use crate::data::tag::{decode_tag_block, logical_tag};
use crate::data::transform::{filter_channels, subtract_offsets};
use crate::data::{
    ChannelSelection, FrameCounters, FrameGeometry, FrameQueue, FrameReshaper, TagStep,
};
use crate::error::{AcqError, AcqResult};
use crate::events::{EventSender, WorkerEvent};
use crate::hardware::{FrameSource, ReadStatus};
use crate::lifecycle::LifecycleState;
use crate::notify::NotificationSink;
use crate::worker::{JoinOutcome, Worker};

const COMPONENT: &str = "FrameCopier";

// =============================================================================
// Shared state
// =============================================================================

#[derive(Debug)]
struct RunState {
    processing: bool,
    counters: FrameCounters,
}

#[derive(Debug)]
struct CopierShared {
    run: Mutex<RunState>,
    halt: AtomicBool,
    kill: AtomicBool,
}

/// Per-frame outcome that ends the acquisition loop.
enum FrameFault {
    Regressed { last: i64, current: u64 },
}

/// Everything the acquisition thread owns while running.
struct CopierRun {
    source: Box<dyn FrameSource>,
    shared: Arc<CopierShared>,
    events: Option<EventSender>,
    geometry: FrameGeometry,
    reshaper: FrameReshaper,
    raw: Vec<u8>,
    frame: Vec<u8>,
    display_buf: Vec<u8>,
    logging_buf: Vec<u8>,
    display_channels: ChannelSelection,
    logging_channels: ChannelSelection,
    offsets: Option<Vec<i16>>,
    display_queue: Arc<FrameQueue>,
    outputs: Vec<Arc<FrameQueue>>,
    callback: Option<Arc<dyn NotificationSink>>,
    source_id: u32,
    decimation: u64,
    one_based: bool,
    timeout: Duration,
}

impl CopierRun {
    fn run(mut self) -> Box<dyn FrameSource> {
        info!(
            elements = self.geometry.fifo_elements(),
            outputs = self.outputs.len(),
            "Acquisition thread started"
        );
        let shared = Arc::clone(&self.shared);
        let elements = self.geometry.fifo_elements();

        loop {
            if shared.kill.load(Ordering::Acquire) || shared.halt.load(Ordering::Acquire) {
                break;
            }

            match self.source.read(&mut self.raw, elements, self.timeout) {
                ReadStatus::Success => {}
                ReadStatus::Timeout => {
                    trace!("FIFO read timed out");
                    continue;
                }
                ReadStatus::Error(code) => {
                    error!(code, "FIFO read failed; ending acquisition");
                    self.post(WorkerEvent::FifoReadFailed { code });
                    break;
                }
            }

            let mut run = shared.run.lock();
            if !run.processing {
                continue;
            }
            if let Err(FrameFault::Regressed { last, current }) =
                self.process_frame(&mut run.counters)
            {
                error!(last, current, "Frame tag went backwards; ending acquisition");
                self.post(WorkerEvent::TagRegressed { last, current });
                break;
            }
        }

        let counters = shared.run.lock().counters;
        info!(
            frames_seen = counters.frames_seen,
            frames_missed = counters.frames_missed,
            "Acquisition thread exiting"
        );
        self.source
    }

    fn post(&self, event: WorkerEvent) {
        if let Some(events) = &self.events {
            events.post(event);
        }
    }

    fn process_frame(&mut self, counters: &mut FrameCounters) -> Result<(), FrameFault> {
        let g = self.geometry;
        let tag = if g.tagging {
            let Some(hardware_tag) = decode_tag_block(&self.raw[g.data_bytes()..]) else {
                warn!("Frame tail is not a tag block; skipping frame");
                return Ok(());
            };
            let tag = logical_tag(hardware_tag, self.one_based);
            match counters.observe_tag(tag) {
                TagStep::Advanced { missed: 0 } => {}
                TagStep::Advanced { missed } => {
                    debug!(tag, missed, "Frames missed before tag");
                }
                TagStep::Duplicate => {
                    trace!(tag, "Duplicate frame tag; skipping");
                    return Ok(());
                }
                TagStep::Regressed { last } => {
                    return Err(FrameFault::Regressed { last, current: tag });
                }
            }
            Some(tag)
        } else {
            counters.observe_untagged();
            None
        };

        self.reshaper.reshape(&self.raw, &mut self.frame);
        let plane = g.channel_bytes();

        let mut display_len = None;
        if counters.frames_seen % self.decimation == 0 {
            let len = filter_channels(
                &self.frame,
                &mut self.display_buf,
                &self.display_channels,
                plane,
                tag,
            );
            if let Some(offsets) = &self.offsets {
                subtract_offsets(
                    &mut self.display_buf,
                    &self.display_channels,
                    offsets,
                    plane,
                    g.signed,
                );
            }
            if self.display_queue.push(&self.display_buf[..len]) {
                if let Some(callback) = &self.callback {
                    callback.notify(self.source_id);
                }
            } else {
                trace!("Display queue rejected frame");
            }
            display_len = Some(len);
        }

        let shares_display = self.logging_channels == self.display_channels;
        let mut logging_len = None;
        for queue in &self.outputs {
            let record: &[u8] = match (shares_display, display_len) {
                (true, Some(len)) => &self.display_buf[..len],
                _ => {
                    let len = match logging_len {
                        Some(len) => len,
                        None => {
                            let len = filter_channels(
                                &self.frame,
                                &mut self.logging_buf,
                                &self.logging_channels,
                                plane,
                                tag,
                            );
                            if let Some(offsets) = &self.offsets {
                                subtract_offsets(
                                    &mut self.logging_buf,
                                    &self.logging_channels,
                                    offsets,
                                    plane,
                                    g.signed,
                                );
                            }
                            logging_len = Some(len);
                            len
                        }
                    };
                    &self.logging_buf[..len]
                }
            };
            if !queue.push(record) {
                debug!(
                    queue = queue.name(),
                    dropped = queue.num_dropped_push_back(),
                    "Output queue full; frame dropped"
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// FrameCopier
// =============================================================================

/// Controller-side handle for the acquisition thread.
pub struct FrameCopier {
    config: Arc<ScanConfig>,
    state: LifecycleState,
    source: Option<Box<dyn FrameSource>>,
    display_queue: Option<Arc<FrameQueue>>,
    output_queues: Vec<Arc<FrameQueue>>,
    callback: Option<Arc<dyn NotificationSink>>,
    callback_enabled: bool,
    source_id: u32,
    decimation: u32,
    events: Option<EventSender>,
    shared: Arc<CopierShared>,
    worker: Option<Worker<Box<dyn FrameSource>>>,
}

impl FrameCopier {
    /// Copier reading frames described by `config`.
    pub fn new(config: Arc<ScanConfig>) -> Self {
        let one_based = config.logging.frame_tag_one_based;
        let source_id = config.acquisition.source_id;
        Self {
            config,
            state: LifecycleState::Constructed,
            source: None,
            display_queue: None,
            output_queues: Vec::new(),
            callback: None,
            callback_enabled: false,
            source_id,
            decimation: 1,
            events: None,
            shared: Arc::new(CopierShared {
                run: Mutex::new(RunState {
                    processing: false,
                    counters: FrameCounters::new(one_based),
                }),
                halt: AtomicBool::new(false),
                kill: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    fn require_configurable(&self, operation: &'static str) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            operation,
            &[
                LifecycleState::Constructed,
                LifecycleState::Armed,
                LifecycleState::Stopped,
            ],
        )
    }

    /// Replace the configuration used by the next run.
    pub fn configure_acq(&mut self, config: Arc<ScanConfig>) -> AcqResult<()> {
        self.require_configurable("configure acquisition")?;
        self.config = config;
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Set the FIFO read by the acquisition thread.
    pub fn configure_source(&mut self, source: Box<dyn FrameSource>) -> AcqResult<()> {
        self.require_configurable("configure source")?;
        self.source = Some(source);
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Set the queue receiving display frames.
    pub fn set_display_queue(&mut self, queue: Arc<FrameQueue>) -> AcqResult<()> {
        self.require_configurable("set display queue")?;
        self.display_queue = Some(queue);
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Set the queues receiving logging frames. May be empty.
    pub fn set_output_queues(&mut self, queues: Vec<Arc<FrameQueue>>) -> AcqResult<()> {
        self.require_configurable("set output queues")?;
        self.output_queues = queues;
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Set the sink notified after each display push, and the id passed to it.
    pub fn configure_callback(
        &mut self,
        sink: Arc<dyn NotificationSink>,
        source_id: u32,
    ) -> AcqResult<()> {
        self.require_configurable("configure callback")?;
        self.callback = Some(sink);
        self.source_id = source_id;
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Enable or disable notifications for the next run.
    pub fn set_callback_enabled(&mut self, enabled: bool) {
        self.callback_enabled = enabled;
    }

    /// Push every `factor`-th frame to the display queue. Zero means every frame.
    pub fn set_decimation_factor(&mut self, factor: u32) {
        self.decimation = factor.max(1);
    }

    /// Report thread failures on `events`.
    pub fn set_event_sender(&mut self, events: EventSender) {
        self.events = Some(events);
    }

    fn arm_failures(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        let geometry = self.config.geometry();
        if let Err(e) = geometry.validate() {
            reasons.push(e.to_string());
            return reasons;
        }
        if geometry.pixel_size_bytes != 2 {
            reasons.push(format!(
                "FIFO samples are 16-bit but pixel_size_bytes is {}",
                geometry.pixel_size_bytes
            ));
        }

        match &self.source {
            None => reasons.push("no frame source".to_string()),
            Some(source) if source.element_width() != geometry.fifo_width() => {
                reasons.push(format!(
                    "frame source delivers {}-byte elements, expected {}",
                    source.element_width().bytes(),
                    geometry.fifo_width().bytes()
                ));
            }
            Some(_) => {}
        }

        match (&self.display_queue, self.config.display_channels()) {
            (None, _) => reasons.push("no display queue".to_string()),
            (Some(_), Err(e)) => reasons.push(e.to_string()),
            (Some(queue), Ok(selection)) => {
                let expected = geometry.record_bytes(selection.count());
                if queue.record_size() != expected {
                    reasons.push(format!(
                        "display queue records are {} bytes, expected {expected}",
                        queue.record_size()
                    ));
                }
            }
        }

        match self.config.logging_channels() {
            Err(e) => reasons.push(e.to_string()),
            Ok(selection) => {
                let expected = geometry.record_bytes(selection.count());
                for queue in &self.output_queues {
                    if queue.record_size() != expected {
                        reasons.push(format!(
                            "output queue '{}' records are {} bytes, expected {expected}",
                            queue.name(),
                            queue.record_size()
                        ));
                    }
                }
            }
        }

        if self.callback.is_none() {
            reasons.push("no notification sink".to_string());
        }
        reasons
    }

    /// Check every precondition for acquisition.
    pub fn arm(&mut self) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "arm",
            &[LifecycleState::Constructed, LifecycleState::Armed],
        )?;
        let reasons = self.arm_failures();
        if !reasons.is_empty() {
            return Err(AcqError::ArmFailed {
                component: COMPONENT,
                reasons,
            });
        }
        self.state = LifecycleState::Armed;
        Ok(())
    }

    /// Return to CONSTRUCTED so collaborators can be replaced.
    pub fn disarm(&mut self) -> AcqResult<()> {
        self.require_configurable("disarm")?;
        self.state = LifecycleState::Constructed;
        Ok(())
    }

    /// Start the acquisition thread. `outputs_enabled[i]` gates output queue `i`.
    pub fn start_processing(&mut self, outputs_enabled: &[bool]) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "start processing",
            &[LifecycleState::Armed, LifecycleState::Stopped],
        )?;
        if outputs_enabled.len() != self.output_queues.len() {
            return Err(AcqError::Configuration(format!(
                "{} output flags given for {} output queue(s)",
                outputs_enabled.len(),
                self.output_queues.len()
            )));
        }
        let reasons = self.arm_failures();
        if !reasons.is_empty() {
            return Err(AcqError::ArmFailed {
                component: COMPONENT,
                reasons,
            });
        }

        let geometry = self.config.geometry();
        let display_channels = self.config.display_channels()?;
        let logging_channels = self.config.logging_channels()?;
        let Some(display_queue) = self.display_queue.clone() else {
            return Err(AcqError::Configuration("display queue missing".into()));
        };
        let Some(source) = self.source.take() else {
            return Err(AcqError::Configuration("frame source missing".into()));
        };

        if !display_queue.is_empty() {
            warn!(
                len = display_queue.len(),
                "Display queue not empty at start; clearing"
            );
            display_queue.reinit();
        }
        for queue in &self.output_queues {
            if !queue.is_empty() {
                warn!(
                    queue = queue.name(),
                    len = queue.len(),
                    "Output queue not empty at start"
                );
            }
        }

        let outputs: Vec<Arc<FrameQueue>> = self
            .output_queues
            .iter()
            .zip(outputs_enabled)
            .filter(|(_, enabled)| **enabled)
            .map(|(queue, _)| Arc::clone(queue))
            .collect();
        let callback = if self.callback_enabled {
            self.callback.clone()
        } else {
            None
        };
        let one_based = self.config.logging.frame_tag_one_based;

        {
            let mut run = self.shared.run.lock();
            run.counters.reset(one_based);
            run.processing = true;
        }
        self.shared.halt.store(false, Ordering::Release);
        self.shared.kill.store(false, Ordering::Release);

        let run = CopierRun {
            source,
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            geometry,
            reshaper: FrameReshaper::new(geometry),
            raw: vec![0; geometry.fifo_elements() * geometry.fifo_width().bytes()],
            frame: vec![0; geometry.data_bytes()],
            display_buf: vec![0; geometry.record_bytes(display_channels.count())],
            logging_buf: vec![0; geometry.record_bytes(logging_channels.count())],
            display_channels,
            logging_channels,
            offsets: self.config.channel_offsets(),
            display_queue,
            outputs,
            callback,
            source_id: self.source_id,
            decimation: u64::from(self.decimation),
            one_based,
            timeout: self.config.frame_wait_timeout(),
        };
        self.worker = Some(Worker::spawn("frame-copier", move || run.run())?);
        self.state = LifecycleState::Running;
        info!(decimation = self.decimation, "Acquisition started");
        Ok(())
    }

    fn wait_for_thread(&mut self) -> AcqResult<bool> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(true);
        };
        match worker.join_timeout(self.config.stop_timeout()) {
            Ok(JoinOutcome::Finished(source)) => {
                self.source = Some(source);
                self.worker = None;
                Ok(true)
            }
            Ok(JoinOutcome::TimedOut) => Ok(false),
            Err(e) => {
                self.worker = None;
                self.state = LifecycleState::Killed;
                Err(e)
            }
        }
    }

    /// Stop the acquisition thread, escalating to kill if it does not exit in time.
    pub fn stop_processing(&mut self) -> AcqResult<()> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        self.state.require(
            COMPONENT,
            "stop processing",
            &[LifecycleState::Running, LifecycleState::Paused],
        )?;

        self.shared.run.lock().processing = false;
        self.shared.halt.store(true, Ordering::Release);
        if self.wait_for_thread()? {
            self.state = LifecycleState::Stopped;
            info!(
                frames_seen = self.frames_seen(),
                frames_missed = self.frames_missed(),
                "Acquisition stopped"
            );
            return Ok(());
        }

        warn!(
            timeout = ?self.config.stop_timeout(),
            "Acquisition thread did not stop in time; killing"
        );
        self.shared.kill.store(true, Ordering::Release);
        if self.wait_for_thread()? {
            self.state = LifecycleState::Stopped;
            return Ok(());
        }
        error!("Acquisition thread did not respond to kill; abandoning it");
        self.kill();
        Err(AcqError::StopTimeout(COMPONENT))
    }

    /// Keep reading the FIFO but stop processing frames.
    pub fn pause_processing(&mut self) -> AcqResult<()> {
        self.state.require(
            COMPONENT,
            "pause processing",
            &[LifecycleState::Running, LifecycleState::Paused],
        )?;
        self.shared.run.lock().processing = false;
        self.state = LifecycleState::Paused;
        Ok(())
    }

    /// Resume processing with fresh counters.
    pub fn resume_processing(&mut self) -> AcqResult<()> {
        self.state
            .require(COMPONENT, "resume processing", &[LifecycleState::Paused])?;
        let one_based = self.config.logging.frame_tag_one_based;
        let mut run = self.shared.run.lock();
        run.counters.reset(one_based);
        run.processing = true;
        drop(run);
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// Signal the thread to exit and abandon it.
    pub fn kill(&mut self) {
        self.shared.kill.store(true, Ordering::Release);
        self.shared.run.lock().processing = false;
        if let Some(worker) = self.worker.take() {
            worker.detach();
        }
        self.state = LifecycleState::Killed;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// True while frames are being processed.
    pub fn is_processing(&self) -> bool {
        self.shared.run.lock().processing
    }

    /// True if the acquisition thread has exited on its own (read failure, tag regression).
    pub fn thread_exited(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_finished)
    }

    /// Snapshot of the run counters.
    pub fn counters(&self) -> FrameCounters {
        self.shared.run.lock().counters
    }

    /// Frames seen since the run (or last resume) started.
    pub fn frames_seen(&self) -> u64 {
        self.counters().frames_seen
    }

    /// Frames the hardware produced that never arrived.
    pub fn frames_missed(&self) -> u64 {
        self.counters().frames_missed
    }

    /// Current display decimation factor.
    pub fn decimation_factor(&self) -> u32 {
        self.decimation
    }

    /// One-line summary of the copier state.
    pub fn debug_string(&self) -> String {
        let counters = self.counters();
        format!(
            "FrameCopier {{ state: {}, processing: {}, frames_seen: {}, frames_missed: {}, last_tag: {}, decimation: {}, outputs: {} }}",
            self.state,
            self.is_processing(),
            counters.frames_seen,
            counters.frames_missed,
            counters.last_tag,
            self.decimation,
            self.output_queues.len(),
        )
    }
}

impl Drop for FrameCopier {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.kill();
        }
    }
}
