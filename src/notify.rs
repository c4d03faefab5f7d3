//! Asynchronous "frame available" notification.
//!
//! After a frame is accepted by the display queue the acquisition thread calls
//! [`NotificationSink::notify`] with the scanner's source id. Implementations must return
//! immediately; delivery only guarantees that the push happened before the notification.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Fire-and-forget receiver of frame notifications.
pub trait NotificationSink: Send + Sync {
    /// Signal that a new display frame is available from `source_id`.
    fn notify(&self, source_id: u32);
}

/// Forwards notifications over a bounded channel, dropping them when the consumer lags.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: Sender<u32>,
}

impl ChannelNotifier {
    /// Notifier plus the receiving end for the consumer.
    pub fn new(capacity: usize) -> (Self, Receiver<u32>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, source_id: u32) {
        match self.tx.try_send(source_id) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!(source_id, "Notification channel full, skipping");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!(source_id, "Notification consumer gone");
            }
        }
    }
}

/// Discards every notification. Used for headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _source_id: u32) {}
}
