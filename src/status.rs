//! Status surface for the UI layer
//!
//! The receiver publishes snapshots through a `tokio::sync::watch` channel;
//! the UI subscribes and renders them however it likes. Only the requested
//! sample rate flows the other way, through [`crate::network::ReceiverHandle`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::audio::buffer::BufferStatus;
use crate::constants::ERROR_DISPLAY_SECS;

/// Everything the UI can observe
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReceiverStatus {
    /// Fill level as a multiple of the target, 0..=2
    pub buffered: f64,
    pub target_latency_seconds: f64,
    /// Most recent error, cleared once it has not recurred for a while
    pub error: Option<String>,
    pub requested_sample_rate: u32,
}

struct ErrorLatch {
    reported_at: Option<Instant>,
}

/// Publishing side of the status surface
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<ReceiverStatus>>,
    latch: Arc<Mutex<ErrorLatch>>,
    error_ttl: Duration,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReceiverStatus::default());
        Self {
            tx: Arc::new(tx),
            latch: Arc::new(Mutex::new(ErrorLatch { reported_at: None })),
            error_ttl: Duration::from_secs(ERROR_DISPLAY_SECS),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReceiverStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ReceiverStatus {
        self.tx.borrow().clone()
    }

    pub fn publish_buffer(&self, status: BufferStatus) {
        self.tx.send_if_modified(|s| {
            let changed = s.buffered != status.buffered_fraction
                || s.target_latency_seconds != status.target_latency_seconds;
            s.buffered = status.buffered_fraction;
            s.target_latency_seconds = status.target_latency_seconds;
            changed
        });
    }

    pub fn set_requested_sample_rate(&self, rate: u32) {
        self.tx.send_if_modified(|s| {
            let changed = s.requested_sample_rate != rate;
            s.requested_sample_rate = rate;
            changed
        });
    }

    /// Show `message` until it has gone unrepeated for the display period
    pub fn report_error(&self, message: impl Into<String>) {
        self.report_error_at(message, Instant::now());
    }

    pub fn report_error_at(&self, message: impl Into<String>, now: Instant) {
        let message = message.into();
        self.latch.lock().reported_at = Some(now);
        self.tx.send_modify(|s| s.error = Some(message));
    }

    /// Clear the error if it has expired
    pub fn expire_error(&self, now: Instant) {
        let mut latch = self.latch.lock();
        let Some(reported_at) = latch.reported_at else {
            return;
        };
        if now.duration_since(reported_at) >= self.error_ttl {
            latch.reported_at = None;
            self.tx.send_modify(|s| s.error = None);
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
