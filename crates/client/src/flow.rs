//! Per-connection flow control
//!
//! The client advertises a buffer size at DCP negotiation; the server
//! stops sending once that window fills. Every frame handed to a callback
//! grows `unacked`; user acks accumulate in `pending` and one BUFFER_ACK
//! is flushed whenever the pending share crosses the watermark.
//!
//! The controller is pure accounting: it reports how many bytes to ack on
//! the wire and the owning channel writes the frame.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ClientError, Result};

#[derive(Debug, Default)]
struct FlowState {
    /// Bytes delivered to callbacks and not yet credited on the wire
    unacked: u64,
    /// User-acked bytes not yet flushed as a BUFFER_ACK
    pending: u64,
}

/// Buffer-ack accounting for one channel
#[derive(Debug)]
pub struct FlowController {
    buffer_size: u32,
    watermark_percent: u8,
    state: Mutex<FlowState>,
    /// Ack handles dropped without an ack; test runs assert this is zero
    leaked: AtomicU64,
    outstanding: AtomicU64,
}

impl FlowController {
    /// Build a controller; `buffer_size == 0` disables flow control
    pub fn new(buffer_size: u32, watermark_percent: u8) -> Result<Self> {
        if buffer_size > 0 && watermark_percent == 0 {
            return Err(ClientError::InvalidConfig(
                "flow control enabled with watermark 0".into(),
            ));
        }
        if watermark_percent > 100 {
            return Err(ClientError::InvalidConfig(format!(
                "watermark {watermark_percent} outside 0..=100"
            )));
        }
        Ok(Self {
            buffer_size,
            watermark_percent,
            state: Mutex::new(FlowState::default()),
            leaked: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
        })
    }

    pub fn enabled(&self) -> bool {
        self.buffer_size > 0
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Record a frame handed to a user callback
    pub fn on_delivered(&self, bytes: u64) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.lock().expect("flow state poisoned");
        state.unacked += bytes;
    }

    /// Record a user ack; returns the byte count to flush on the wire when
    /// the watermark is crossed
    pub fn ack(&self, bytes: u64) -> Option<u32> {
        if !self.enabled() {
            return None;
        }
        let mut state = self.state.lock().expect("flow state poisoned");
        state.pending += bytes;
        let threshold = u64::from(self.buffer_size) * u64::from(self.watermark_percent);
        if state.pending * 100 >= threshold {
            let flushed = state.pending;
            state.unacked = state.unacked.saturating_sub(flushed);
            state.pending = 0;
            Some(flushed.min(u64::from(u32::MAX)) as u32)
        } else {
            None
        }
    }

    /// Bytes delivered but not yet credited on the wire
    pub fn unacked_bytes(&self) -> u64 {
        self.state.lock().expect("flow state poisoned").unacked
    }

    pub(crate) fn handle_created(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handle_finished(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn handle_leaked(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.leaked.fetch_add(1, Ordering::Relaxed);
    }

    /// Ack handles alive right now
    pub fn outstanding_handles(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Ack handles dropped without being acked
    pub fn leaked_handles(&self) -> u64 {
        self.leaked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "flow_test.rs"]
mod tests;
