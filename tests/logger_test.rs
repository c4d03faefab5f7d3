//! Integration tests for the logging thread
//!
//! Covers file rollover through notes, averaging, the frame-delay threshold, abort paths
//! and the bounded stop escalation (drain, then kill, then abandon).

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{small_config, wait_until, RecordingSink};
use resonant_acq::config::ScanConfig;
use resonant_acq::data::tag::encode_tag_block;
use resonant_acq::data::{FrameQueue, OverflowPolicy};
use resonant_acq::error::AcqError;
use resonant_acq::events::{event_channel, WorkerEvent};
use resonant_acq::lifecycle::LifecycleState;
use resonant_acq::storage::logger::frame_tag_text;
use resonant_acq::storage::{
    FrameFileReader, FrameFileWriter, FrameLogger, FrameSink, LogFileNote, FRAME_TAG_TEXT_LEN,
};

/// One logging-queue record of `config` with every sample set to `value`.
fn record(config: &ScanConfig, value: i16, tag: u64) -> Vec<u8> {
    let geometry = config.geometry();
    let mut r = Vec::with_capacity(geometry.record_bytes(1));
    for _ in 0..geometry.frame_pixels() {
        r.extend_from_slice(&value.to_le_bytes());
    }
    r.extend_from_slice(&encode_tag_block(tag));
    r
}

fn logging_queue(config: &ScanConfig, capacity: usize) -> Arc<FrameQueue> {
    Arc::new(
        FrameQueue::new(
            "logging",
            config.geometry().record_bytes(1),
            capacity,
            OverflowPolicy::RejectNewest,
        )
        .unwrap(),
    )
}

fn logger(
    config: ScanConfig,
    sink: impl FrameSink + 'static,
    queue: &Arc<FrameQueue>,
    average: u32,
    header: &str,
    first_file: &str,
) -> FrameLogger {
    let mut logger = FrameLogger::new(Arc::new(config), Box::new(sink));
    logger.set_input_queue(Arc::clone(queue)).unwrap();
    logger.configure_image(average, header).unwrap();
    logger.configure_file(first_file, "wbn").unwrap();
    logger.arm().unwrap();
    logger
}

#[test]
fn test_rollover_notes_split_frames_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let file = |name: &str| dir.path().join(name);
    let config = small_config();
    let queue = logging_queue(&config, 16);
    for tag in 1..=12 {
        assert!(queue.push(&record(&config, tag as i16, tag)));
    }

    let mut logger = logger(
        config,
        FrameFileWriter::new(),
        &queue,
        1,
        "first header",
        file("a.rsf").to_str().unwrap(),
    );
    logger
        .add_rollover_note(LogFileNote::new(file("b.rsf"), "wbn", 5).with_header("second header"))
        .unwrap();
    logger
        .add_rollover_note(LogFileNote::new(file("c.rsf"), "w", 10))
        .unwrap();

    logger.start_logging().unwrap();
    logger.stop_logging().unwrap();
    assert_eq!(logger.state(), LifecycleState::Stopped);
    assert_eq!(logger.frames_logged(), 12);
    assert!(queue.is_empty());
    assert!(logger.pending_notes().is_empty());

    let read = |name: &str| FrameFileReader::open(file(name)).unwrap().read_all().unwrap();
    let a = read("a.rsf");
    let b = read("b.rsf");
    let c = read("c.rsf");
    assert_eq!((a.len(), b.len(), c.len()), (4, 5, 3));

    assert_eq!(&a[0].description[..FRAME_TAG_TEXT_LEN], frame_tag_text(1));
    assert!(a[0].description[FRAME_TAG_TEXT_LEN..].starts_with("first header"));
    assert_eq!(&b[0].description[..FRAME_TAG_TEXT_LEN], frame_tag_text(5));
    assert!(b[0].description[FRAME_TAG_TEXT_LEN..].starts_with("second header"));
    // The replacement header keeps the configured description length.
    assert_eq!(a[0].description.len(), b[0].description.len());
    // No header on the third note: the second header carries over.
    assert!(c[2].description[FRAME_TAG_TEXT_LEN..].starts_with("second header"));
    assert_eq!(&c[2].description[..FRAME_TAG_TEXT_LEN], frame_tag_text(12));

    let first_sample = i16::from_le_bytes([c[0].data[0], c[0].data[1]]);
    assert_eq!(first_sample, 10);
}

#[test]
fn test_multibyte_rollover_header_fills_reserved_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.rsf");
    let second = dir.path().join("b.rsf");
    let config = small_config();
    let queue = logging_queue(&config, 16);
    for tag in 1..=4 {
        assert!(queue.push(&record(&config, tag as i16, tag)));
    }

    let (events, receiver) = event_channel();
    let mut logger = logger(
        config,
        FrameFileWriter::new(),
        &queue,
        1,
        "",
        first.to_str().unwrap(),
    );
    logger.set_event_sender(events);
    // 10 bytes, 7 characters
    let header = "µm µm";
    logger
        .add_rollover_note(LogFileNote::new(&second, "wbn", 3).with_header(header))
        .unwrap();

    logger.start_logging().unwrap();
    logger.stop_logging().unwrap();
    assert!(receiver.try_iter().next().is_none());
    assert_eq!(logger.frames_logged(), 4);

    let a = FrameFileReader::open(&first).unwrap().read_all().unwrap();
    let b = FrameFileReader::open(&second).unwrap().read_all().unwrap();
    assert_eq!((a.len(), b.len()), (2, 2));
    assert_eq!(a[0].description.len(), b[0].description.len());
    assert_eq!(&b[0].description[..FRAME_TAG_TEXT_LEN], frame_tag_text(3));
    assert_eq!(
        b[0].description[FRAME_TAG_TEXT_LEN..].trim_end(),
        header
    );
}

#[test]
fn test_late_note_is_discarded() {
    let config = small_config();
    let queue = logging_queue(&config, 16);
    let (sink, log) = RecordingSink::new();
    let mut logger = logger(config.clone(), sink, &queue, 1, "", "a.rsf");

    logger.start_logging().unwrap();
    for tag in 1..=5 {
        queue.push(&record(&config, 0, tag));
    }
    assert!(wait_until(Duration::from_secs(2), || logger.frames_logged() == 5));

    // Frame 3 is long gone.
    logger
        .add_rollover_note(LogFileNote::new("b.rsf", "w", 3))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || logger
        .pending_notes()
        .is_empty()));
    for tag in 6..=7 {
        queue.push(&record(&config, 0, tag));
    }
    logger.stop_logging().unwrap();

    let log = log.lock();
    assert_eq!(log.files(), vec![std::path::PathBuf::from("a.rsf")]);
    assert_eq!(log.writes_to("a.rsf"), 7);
    assert_eq!(log.closes, 1);
}

#[test]
fn test_averaging_writes_one_mean_per_group() {
    let config = small_config();
    let queue = logging_queue(&config, 16);
    for (tag, value) in (1..=8).zip([10, 20, 30, 40, -4, -4, -4, -5]) {
        queue.push(&record(&config, value, tag));
    }
    let (sink, log) = RecordingSink::new();
    let mut logger = logger(config, sink, &queue, 4, "averaged", "avg.rsf");

    logger.start_logging().unwrap();
    logger.stop_logging().unwrap();
    assert_eq!(logger.frames_logged(), 8);

    let log = log.lock();
    assert_eq!(log.writes.len(), 2);
    let first = &log.writes[0];
    let second = &log.writes[1];
    assert_eq!(&first.description[..FRAME_TAG_TEXT_LEN], frame_tag_text(4));
    assert_eq!(&second.description[..FRAME_TAG_TEXT_LEN], frame_tag_text(8));

    let samples = |data: &[u8]| -> Vec<i16> {
        data.chunks_exact(2)
            .map(|s| i16::from_le_bytes([s[0], s[1]]))
            .collect()
    };
    assert!(samples(&first.data).iter().all(|&s| s == 25));
    // -17 / 4 truncates toward zero
    assert!(samples(&second.data).iter().all(|&s| s == -4));
}

#[test]
fn test_partial_average_group_is_not_written() {
    let config = small_config();
    let queue = logging_queue(&config, 16);
    for tag in 1..=6 {
        queue.push(&record(&config, 7, tag));
    }
    let (sink, log) = RecordingSink::new();
    let mut logger = logger(config, sink, &queue, 4, "", "avg.rsf");

    logger.start_logging().unwrap();
    logger.stop_logging().unwrap();
    assert_eq!(logger.frames_logged(), 6);
    assert_eq!(log.lock().writes.len(), 1);
}

#[test]
fn test_frame_delay_holds_back_recent_frames() {
    let mut config = small_config();
    config.logging.frame_delay = 2;
    let queue = logging_queue(&config, 16);
    let (sink, log) = RecordingSink::new();
    let mut logger = logger(config.clone(), sink, &queue, 1, "", "delay.rsf");

    logger.start_logging().unwrap();
    for tag in 1..=3 {
        queue.push(&record(&config, 0, tag));
    }
    assert!(wait_until(Duration::from_secs(2), || logger.frames_logged() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(logger.frames_logged(), 1);
    assert_eq!(queue.len(), 2);

    // Halting flushes what the delay held back.
    logger.stop_logging().unwrap();
    assert_eq!(logger.frames_logged(), 3);
    assert_eq!(log.lock().writes.len(), 3);
}

#[test]
fn test_slow_drain_escalates_to_immediate_stop() {
    let mut config = small_config();
    config.acquisition.stop_timeout_ms = 400;
    let queue = logging_queue(&config, 16);
    for tag in 1..=5 {
        queue.push(&record(&config, 0, tag));
    }
    let (sink, log) = RecordingSink::slow(Duration::from_millis(150));
    let mut logger = logger(config, sink, &queue, 1, "", "slow.rsf");

    logger.start_logging().unwrap();
    let start = Instant::now();
    logger.stop_logging().unwrap();
    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(logger.state(), LifecycleState::Stopped);

    let written = log.lock().writes.len();
    assert!(written < 5, "All frames drained despite the timeout");
    assert_eq!(queue.len(), 5 - written);
}

#[test]
fn test_unresponsive_thread_is_abandoned() {
    let mut config = small_config();
    config.acquisition.stop_timeout_ms = 100;
    let queue = logging_queue(&config, 16);
    queue.push(&record(&config, 0, 1));
    let (sink, _log) = RecordingSink::slow(Duration::from_secs(2));
    let mut logger = logger(config, sink, &queue, 1, "", "stuck.rsf");

    logger.start_logging().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    let result = logger.stop_logging();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(result, Err(AcqError::StopTimeout(_))));
    assert_eq!(logger.state(), LifecycleState::Killed);
    assert!(logger.start_logging().is_err());
}

#[test]
fn test_open_failure_aborts_logging() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no/such/dir/frames.rsf");
    let config = small_config();
    let queue = logging_queue(&config, 16);
    queue.push(&record(&config, 0, 1));

    let mut logger = logger(
        config,
        FrameFileWriter::new(),
        &queue,
        1,
        "",
        missing.to_str().unwrap(),
    );
    let (events_tx, events) = event_channel();
    logger.set_event_sender(events_tx);

    logger.start_logging().unwrap();
    let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(event, WorkerEvent::LoggingAborted { .. }));
    logger.stop_logging().unwrap();
    assert_eq!(logger.state(), LifecycleState::Stopped);
    assert_eq!(logger.frames_logged(), 0);
}

#[test]
fn test_oversized_rollover_header_aborts_logging() {
    let config = small_config();
    let queue = logging_queue(&config, 16);
    for tag in 1..=3 {
        queue.push(&record(&config, 0, tag));
    }
    let (sink, log) = RecordingSink::new();
    let mut logger = logger(config, sink, &queue, 1, "", "a.rsf");
    logger
        .add_rollover_note(LogFileNote::new("b.rsf", "w", 2).with_header("x".repeat(300)))
        .unwrap();
    let (events_tx, events) = event_channel();
    logger.set_event_sender(events_tx);

    logger.start_logging().unwrap();
    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        WorkerEvent::LoggingAborted { reason } => assert!(reason.contains("300"), "{reason}"),
        other => panic!("Unexpected event {other:?}"),
    }
    logger.stop_logging().unwrap();

    let log = log.lock();
    assert_eq!(log.writes_to("a.rsf"), 1);
    assert_eq!(log.writes_to("b.rsf"), 0);
}

#[test]
fn test_restart_after_stop_uses_new_file() {
    let config = small_config();
    let queue = logging_queue(&config, 16);
    let (sink, log) = RecordingSink::new();
    let mut logger = logger(config.clone(), sink, &queue, 1, "", "run1.rsf");

    queue.push(&record(&config, 0, 1));
    logger.start_logging().unwrap();
    logger.stop_logging().unwrap();

    logger.configure_file("run2.rsf", "w").unwrap();
    queue.push(&record(&config, 0, 2));
    logger.start_logging().unwrap();
    logger.stop_logging().unwrap();

    let log = log.lock();
    assert_eq!(log.writes_to("run1.rsf"), 1);
    assert_eq!(log.writes_to("run2.rsf"), 1);
    assert_eq!(logger.frames_logged(), 1);
}
