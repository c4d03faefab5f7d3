//! Shared fixtures for the integration tests: a scripted FIFO, a recording frame sink and
//! a counting notifier.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use resonant_acq::config::ScanConfig;
use resonant_acq::data::tag::encode_tag_block;
use resonant_acq::data::FrameGeometry;
use resonant_acq::error::{AcqError, AcqResult};
use resonant_acq::hardware::{FifoWidth, FrameSource, ReadStatus};
use resonant_acq::notify::NotificationSink;
use resonant_acq::storage::{FrameSink, ImageLayout, OpenMode};

/// Small single-channel tagged configuration.
pub fn small_config() -> ScanConfig {
    let toml_str = r#"
        [geometry]
        pixels_per_line = 8
        lines_per_frame = 4
        multi_channel = false
        frame_tagging = true
        pixel_size_bytes = 2
        signed_data = true

        [acquisition]
        queue_capacity = 16
        frame_wait_timeout_ms = 20
        stop_timeout_ms = 2000
        simulated_frame_interval_ms = 1
    "#;
    toml::from_str(toml_str).expect("Failed to parse test config")
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// One scripted FIFO read.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// A frame carrying this hardware (zero-based) tag
    Frame(u64),
    /// A driver error
    Error(i32),
}

/// FIFO replaying a fixed script, then timing out forever.
///
/// Every sample of channel `c` holds `value + 256 * c`.
pub struct ScriptedSource {
    geometry: FrameGeometry,
    steps: VecDeque<Step>,
    value: i16,
    delivered: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(geometry: FrameGeometry, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            geometry,
            steps: steps.into_iter().collect(),
            value: 0,
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Frames with consecutive hardware tags `0..count`.
    pub fn sequential(geometry: FrameGeometry, count: u64) -> Self {
        Self::new(geometry, (0..count).map(Step::Frame))
    }

    pub fn with_value(mut self, value: i16) -> Self {
        self.value = value;
        self
    }

    /// Counter of script steps consumed (frames and errors).
    pub fn delivered(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.delivered)
    }
}

impl FrameSource for ScriptedSource {
    fn read(&mut self, buffer: &mut [u8], _elements: usize, timeout: Duration) -> ReadStatus {
        let Some(step) = self.steps.pop_front() else {
            thread::sleep(timeout);
            return ReadStatus::Timeout;
        };
        self.delivered.fetch_add(1, Ordering::SeqCst);

        match step {
            Step::Error(code) => ReadStatus::Error(code),
            Step::Frame(tag) => {
                let g = self.geometry;
                for (i, sample) in buffer[..g.data_bytes()].chunks_exact_mut(2).enumerate() {
                    let channel = i % g.channels;
                    let v = self.value.wrapping_add(256 * channel as i16);
                    sample.copy_from_slice(&v.to_le_bytes());
                }
                if g.tagging {
                    let at = g.data_bytes();
                    buffer[at..at + 8].copy_from_slice(&encode_tag_block(tag));
                }
                ReadStatus::Success
            }
        }
    }

    fn element_width(&self) -> FifoWidth {
        self.geometry.fifo_width()
    }
}

/// One frame written to a [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct WrittenFrame {
    pub file: PathBuf,
    pub description: String,
    pub data: Vec<u8>,
}

/// Everything a [`RecordingSink`] saw.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub opens: Vec<(PathBuf, OpenMode)>,
    pub closes: usize,
    pub writes: Vec<WrittenFrame>,
}

impl SinkLog {
    pub fn files(&self) -> Vec<PathBuf> {
        self.opens.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn writes_to(&self, file: &str) -> usize {
        self.writes
            .iter()
            .filter(|w| w.file == Path::new(file))
            .count()
    }
}

/// In-memory [`FrameSink`] with an optional per-write delay.
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    description: Vec<u8>,
    current: Option<PathBuf>,
    write_delay: Duration,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let sink = Self {
            log: Arc::clone(&log),
            description: Vec::new(),
            current: None,
            write_delay: Duration::ZERO,
        };
        (sink, log)
    }

    pub fn slow(delay: Duration) -> (Self, Arc<Mutex<SinkLog>>) {
        let (mut sink, log) = Self::new();
        sink.write_delay = delay;
        (sink, log)
    }
}

impl FrameSink for RecordingSink {
    fn configure_image(&mut self, _layout: ImageLayout, description: &str) -> AcqResult<()> {
        self.description = description.as_bytes().to_vec();
        Ok(())
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> AcqResult<()> {
        self.log.lock().opens.push((path.to_path_buf(), mode));
        self.current = Some(path.to_path_buf());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.current.is_some()
    }

    fn write_frame(&mut self, data: &[u8]) -> AcqResult<()> {
        let file = self
            .current
            .clone()
            .ok_or_else(|| AcqError::Storage("not open".into()))?;
        thread::sleep(self.write_delay);
        self.log.lock().writes.push(WrittenFrame {
            file,
            description: String::from_utf8_lossy(&self.description).into_owned(),
            data: data.to_vec(),
        });
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
        if self.current.take().is_some() {
            self.log.lock().closes += 1;
        }
        Ok(())
    }
}

/// Counts notifications.
#[derive(Debug, Default)]
pub struct CountingNotifier {
    pub count: AtomicUsize,
    pub last_source: AtomicUsize,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl NotificationSink for CountingNotifier {
    fn notify(&self, source_id: u32) {
        self.last_source.store(source_id as usize, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decode the tag at the end of a queued record.
pub fn record_tag(record: &[u8]) -> u64 {
    resonant_acq::data::tag::decode_tag_block(&record[record.len() - 8..]).unwrap_or(u64::MAX)
}
