//! Embedder-facing callbacks and the ack handle
//!
//! Callbacks run on the owning channel's I/O task and must not block.
//! Every delivered frame comes with an [`AckHandle`] that must be acked
//! exactly once, even when the payload is discarded; the handle feeds the
//! flow controller of the originating channel.

use std::sync::Arc;

use riptide_protocol::{DataEvent, Frame, SnapshotMarker, SystemEventMessage, request};
use tokio::sync::mpsc;

use crate::events::SystemEvent;
use crate::flow::FlowController;

/// Non-data frames surfaced to the control callback
#[derive(Debug, Clone)]
pub enum ControlEvent {
    SnapshotMarker(SnapshotMarker),
    SystemEvent(SystemEventMessage),
    /// Derived from a STREAM_REQ rollback response; carries no wire bytes
    Rollback { vbid: u16, seqno: u64 },
}

/// Receives mutations, deletions and expirations
///
/// Invoked on the channel I/O task; implementations must not block.
pub trait DataEventHandler: Send + Sync {
    fn on_data_event(&self, ack: AckHandle, event: DataEvent);
}

/// Receives snapshot markers, system events and rollback notices
///
/// Invoked on the channel I/O task; implementations must not block.
pub trait ControlEventHandler: Send + Sync {
    fn on_control_event(&self, ack: AckHandle, event: ControlEvent);
}

/// Observes the recovery event stream
pub trait SystemEventHandler: Send + Sync {
    fn on_system_event(&self, event: &SystemEvent);
}

/// Scoped acknowledgement of one delivered frame
///
/// Dropping a handle without calling [`ack`](Self::ack) is a contract
/// violation: it is logged, counted by the flow controller's leak
/// detector, and the bytes are never credited back to the producer.
#[derive(Debug)]
pub struct AckHandle {
    flow: Arc<FlowController>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    bytes: u64,
    finished: bool,
}

impl AckHandle {
    pub(crate) fn new(
        flow: Arc<FlowController>,
        writer: Option<mpsc::UnboundedSender<Frame>>,
        bytes: u64,
    ) -> Self {
        flow.handle_created();
        Self {
            flow,
            writer,
            bytes,
            finished: false,
        }
    }

    /// Wire size of the frame this handle covers
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Credit the frame back to the producer window
    pub fn ack(mut self) {
        self.finished = true;
        self.flow.handle_finished();
        if let Some(flush) = self.flow.ack(self.bytes)
            && let Some(writer) = &self.writer
        {
            let _ = writer.send(request::buffer_ack(flush));
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.flow.handle_leaked();
            tracing::warn!(bytes = self.bytes, "ack handle dropped without ack");
        }
    }
}
