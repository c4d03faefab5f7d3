//! Bounded, fixed-record-size circular frame queue.
//!
//! One writer (the acquisition thread) and one reader (the controller or the logging
//! thread) share a queue through an `Arc`. Record bytes live in a single pre-allocated
//! slab; only the head/count cursor sits behind a short `parking_lot::Mutex`, and the
//! record copies themselves happen outside the lock.
//!
//! # Slot ownership
//! ```text
//!   head                 head+count
//!    |<---- readable ---->|<- writer's next slot
//! [  A  |  B  |  C  |     |     ]
//! ```
//! The writer reserves `(head + count) % capacity`, copies into it unlocked and then
//! publishes it by bumping `count`. A pop advances `head` and decrements `count`
//! together, so the reserved slot index is stable while the copy is in flight.
//!
//! # Overflow
//! A full queue never blocks the writer. [`OverflowPolicy::DropOldest`] evicts the front
//! record ("latest wins") unless it is checked out, in which case the incoming frame is
//! rejected instead. [`OverflowPolicy::RejectNewest`] always rejects the incoming frame.
//! Both count towards [`FrameQueue::num_dropped_push_back`].

// Slot storage is written by one thread and read by another.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AcqResult};

/// What a full queue does with an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest record to make room. Used for display queues.
    DropOldest,
    /// Refuse the incoming record. Used for logging queues.
    RejectNewest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropOldest => f.write_str("drop-oldest"),
            Self::RejectNewest => f.write_str("reject-newest"),
        }
    }
}

#[derive(Debug, Default)]
struct Cursor {
    head: usize,
    count: usize,
    checked_out: bool,
}

/// Single-producer/single-consumer ring of equally sized frame records.
pub struct FrameQueue {
    name: String,
    record_size: usize,
    capacity: usize,
    policy: OverflowPolicy,
    slots: Box<[UnsafeCell<u8>]>,
    cursor: Mutex<Cursor>,
    readable: Condvar,
    dropped: AtomicU64,
}

// SAFETY: slot bytes are only touched through `slot_ptr`. The writer copies into the one
// slot it reserved under `cursor`, readers only read slots inside [head, head+count), and
// the cursor lock orders the copy before the record becomes visible to the reader.
unsafe impl Sync for FrameQueue {}

fn allocate(record_size: usize, capacity: usize) -> Box<[UnsafeCell<u8>]> {
    (0..record_size * capacity)
        .map(|_| UnsafeCell::new(0u8))
        .collect()
}

impl FrameQueue {
    /// Create a queue holding up to `capacity` records of `record_size` bytes.
    pub fn new(
        name: impl Into<String>,
        record_size: usize,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> AcqResult<Self> {
        let mut queue = Self {
            name: name.into(),
            record_size: 0,
            capacity: 0,
            policy,
            slots: Box::new([]),
            cursor: Mutex::new(Cursor::default()),
            readable: Condvar::new(),
            dropped: AtomicU64::new(0),
        };
        queue.init(record_size, capacity, policy)?;
        Ok(queue)
    }

    /// Reallocate storage for a new record size and capacity and reset occupancy.
    ///
    /// Requires exclusive access, so it cannot race with a writer or reader.
    pub fn init(
        &mut self,
        record_size: usize,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> AcqResult<()> {
        if record_size == 0 || capacity == 0 {
            return Err(AcqError::Configuration(format!(
                "frame queue '{}' needs a non-zero record size and capacity (got {record_size} x {capacity})",
                self.name
            )));
        }
        self.slots = allocate(record_size, capacity);
        self.record_size = record_size;
        self.capacity = capacity;
        self.policy = policy;
        *self.cursor.get_mut() = Cursor::default();
        self.dropped.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Clear occupancy and the dropped counter, keeping the allocation.
    ///
    /// Controller-only; callers make sure no worker is pushing or popping.
    pub fn reinit(&self) {
        let mut cursor = self.cursor.lock();
        cursor.head = 0;
        cursor.count = 0;
        self.dropped.store(0, Ordering::Relaxed);
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.capacity);
        // SAFETY: slot < capacity, so the offset stays inside `slots`.
        unsafe { UnsafeCell::raw_get(self.slots.as_ptr().add(slot * self.record_size)) }
    }

    /// Copy one record into the queue. Returns true iff the frame was accepted.
    ///
    /// Never blocks; a full queue applies the overflow policy instead. `frame` must hold
    /// at least `record_size` bytes; only the first `record_size` are copied.
    pub fn push(&self, frame: &[u8]) -> bool {
        if frame.len() < self.record_size {
            tracing::warn!(
                queue = %self.name,
                expected = self.record_size,
                actual = frame.len(),
                "Rejecting short frame"
            );
            return false;
        }

        let slot = {
            let mut cursor = self.cursor.lock();
            if cursor.count == self.capacity {
                if self.policy == OverflowPolicy::RejectNewest || cursor.checked_out {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                cursor.head = (cursor.head + 1) % self.capacity;
                cursor.count -= 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            (cursor.head + cursor.count) % self.capacity
        };

        // SAFETY: `slot` is outside [head, head+count), so no reader touches it, and this
        // is the only writer.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), self.slot_ptr(slot), self.record_size);
        }

        self.cursor.lock().count += 1;
        self.readable.notify_all();
        true
    }

    /// Discard the oldest record.
    pub fn pop(&self) -> AcqResult<()> {
        let mut cursor = self.cursor.lock();
        if cursor.count == 0 {
            return Err(AcqError::QueueEmpty(self.name.clone()));
        }
        if cursor.checked_out {
            return Err(AcqError::CheckoutOutstanding(self.name.clone()));
        }
        cursor.head = (cursor.head + 1) % self.capacity;
        cursor.count -= 1;
        Ok(())
    }

    /// Borrow the oldest record and pin it until the returned guard is dropped.
    ///
    /// While pinned the record cannot be popped or evicted; the writer may keep appending.
    pub fn front_checkout(&self) -> AcqResult<FrontGuard<'_>> {
        let mut cursor = self.cursor.lock();
        if cursor.count == 0 {
            return Err(AcqError::QueueEmpty(self.name.clone()));
        }
        if cursor.checked_out {
            return Err(AcqError::CheckoutOutstanding(self.name.clone()));
        }
        cursor.checked_out = true;
        Ok(FrontGuard {
            queue: self,
            slot: cursor.head,
        })
    }

    /// Borrow the oldest record without pinning it.
    ///
    /// # Safety
    /// The caller must be the only reader, and must not hold the slice across a `pop`,
    /// `reinit`, or a push that could evict the front record of a full `DropOldest` queue.
    pub unsafe fn front_unchecked(&self) -> Option<&[u8]> {
        let cursor = self.cursor.lock();
        if cursor.count == 0 {
            return None;
        }
        Some(std::slice::from_raw_parts(
            self.slot_ptr(cursor.head),
            self.record_size,
        ))
    }

    /// Block until at least `min` records are queued or `timeout` elapses.
    /// Returns whether the condition holds on return.
    pub fn wait_for_len(&self, min: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cursor = self.cursor.lock();
        while cursor.count < min {
            if self.readable.wait_until(&mut cursor, deadline).timed_out() {
                break;
            }
        }
        cursor.count >= min
    }

    /// Wake any thread blocked in [`FrameQueue::wait_for_len`].
    pub fn wake_waiters(&self) {
        self.readable.notify_all();
    }

    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        self.cursor.lock().count
    }

    /// True if no records are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes of every record.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Maximum number of records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy fixed at init.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Queue name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pushes rejected or evictions forced by a full queue since the last (re)init.
    pub fn num_dropped_push_back(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// One-paragraph status dump.
    pub fn debug_string(&self) -> String {
        let cursor = self.cursor.lock();
        format!(
            "--FrameQueue '{}'--\nCapacity RecordSize Size Dropped Policy CheckedOut: {} {} {} {} {} {}\n",
            self.name,
            self.capacity,
            self.record_size,
            cursor.count,
            self.num_dropped_push_back(),
            self.policy,
            cursor.checked_out
        )
    }

    fn checkin(&self) {
        self.cursor.lock().checked_out = false;
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("record_size", &self.record_size)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

/// Pinned view of a queue's front record. Dropping it checks the record back in.
pub struct FrontGuard<'a> {
    queue: &'a FrameQueue,
    slot: usize,
}

impl FrontGuard<'_> {
    /// Explicit checkin; equivalent to dropping the guard.
    pub fn checkin(self) {}
}

impl Deref for FrontGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the slot is pinned by `checked_out`, so it can be neither popped nor
        // evicted, and the writer never targets an occupied slot.
        unsafe { std::slice::from_raw_parts(self.queue.slot_ptr(self.slot), self.queue.record_size) }
    }
}

impl Drop for FrontGuard<'_> {
    fn drop(&mut self) {
        self.queue.checkin();
    }
}
