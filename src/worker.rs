//! Named worker threads with a bounded join.
//!
//! `std::thread::JoinHandle` has no timed join, so each worker carries a completion
//! channel. A guard inside the thread sends on it when the closure returns or unwinds,
//! letting the controller wait with `recv_timeout` and only then call `join`, which is
//! guaranteed not to block.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{AcqError, AcqResult};

/// Signals completion when dropped, including during a panic unwind.
struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// Outcome of a bounded join.
#[derive(Debug)]
pub enum JoinOutcome<T> {
    /// The worker returned its value.
    Finished(T),
    /// The worker is still running after the timeout; the handle is kept.
    TimedOut,
}

/// Handle to a worker thread that returns `T` on exit.
pub struct Worker<T> {
    name: &'static str,
    handle: Option<JoinHandle<T>>,
    done: Receiver<()>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `body` on a new thread named `name`.
    pub fn spawn<F>(name: &'static str, body: F) -> AcqResult<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = DoneGuard(done_tx);
                body()
            })?;

        Ok(Self {
            name,
            handle: Some(handle),
            done: done_rx,
        })
    }

    /// Wait up to `timeout` for the worker to exit, then join it.
    pub fn join_timeout(&mut self, timeout: Duration) -> AcqResult<JoinOutcome<T>> {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => return Ok(JoinOutcome::TimedOut),
        }

        let handle = self
            .handle
            .take()
            .ok_or(AcqError::WorkerPanicked(self.name))?;
        handle
            .join()
            .map(JoinOutcome::Finished)
            .map_err(|_| AcqError::WorkerPanicked(self.name))
    }

    /// True once the worker body has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Drop the handle without waiting. The thread exits on its own.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_join_returns_value() {
        let mut worker = Worker::spawn("test-worker", || 42).unwrap();
        match worker.join_timeout(Duration::from_secs(1)).unwrap() {
            JoinOutcome::Finished(v) => assert_eq!(v, 42),
            JoinOutcome::TimedOut => panic!("worker should have finished"),
        }
    }

    #[test]
    fn test_join_times_out_then_succeeds() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();
        let mut worker = Worker::spawn("test-worker", move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
            "done"
        })
        .unwrap();

        assert!(matches!(
            worker.join_timeout(Duration::from_millis(20)).unwrap(),
            JoinOutcome::TimedOut
        ));
        assert!(!worker.is_finished());

        release.store(true, Ordering::Release);
        assert!(matches!(
            worker.join_timeout(Duration::from_secs(1)).unwrap(),
            JoinOutcome::Finished("done")
        ));
    }

    #[test]
    fn test_panicking_worker_is_reported() {
        let mut worker = Worker::spawn("test-worker", || -> u32 { panic!("boom") }).unwrap();
        let err = worker.join_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AcqError::WorkerPanicked("test-worker")));
    }
}
