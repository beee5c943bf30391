//! System events and the typed event bus
//!
//! Anomalies observed on channels are published as one closed sum type.
//! The fixer is the single recovery consumer; the embedder's system-event
//! handler observes the same stream for visibility.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use riptide_protocol::{Status, StreamEndReason};
use tokio::sync::mpsc;

use crate::handler::SystemEventHandler;

/// Anomalies and lifecycle signals routed to the fixer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// A channel socket died while connected
    ChannelDropped { address: SocketAddr },

    /// The producer (or this client) ended a stream
    StreamEnd {
        vbid: u16,
        reason: StreamEndReason,
        /// A failover-log request was pending when the stream ended
        failover_logs_requested: bool,
        /// Remote seqnos were never sampled on the owning channel
        seqnos_requested: bool,
    },

    /// A STREAM_REQ came back with a non-success status other than rollback
    OpenStreamFailed {
        vbid: u16,
        status: Status,
        /// Partition backoff captured when the response arrived
        delay: Duration,
    },

    /// The server demands a rollback to `seqno` for this partition
    Rollback { vbid: u16, seqno: u64 },

    /// The fixer gave up; the client is disconnecting
    UnexpectedFailure { cause: String },

    /// Poison pill ending the fixer loop
    Disconnect,
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelDropped { address } => write!(f, "channel dropped: {address}"),
            Self::StreamEnd { vbid, reason, .. } => {
                write!(f, "stream end on vbucket {vbid}: {reason}")
            }
            Self::OpenStreamFailed { vbid, status, .. } => {
                write!(f, "open stream failed on vbucket {vbid}: {status}")
            }
            Self::Rollback { vbid, seqno } => {
                write!(f, "rollback on vbucket {vbid} to seqno {seqno}")
            }
            Self::UnexpectedFailure { cause } => write!(f, "unexpected failure: {cause}"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Statically-typed publish surface feeding the fixer and the embedder
#[derive(Clone)]
pub struct EventBus {
    fixer_tx: mpsc::UnboundedSender<SystemEvent>,
    user: Option<Arc<dyn SystemEventHandler>>,
}

impl EventBus {
    pub fn new(
        fixer_tx: mpsc::UnboundedSender<SystemEvent>,
        user: Option<Arc<dyn SystemEventHandler>>,
    ) -> Self {
        Self { fixer_tx, user }
    }

    /// Publish to the embedder first, then to the fixer inbox
    ///
    /// Sends after fixer shutdown are dropped silently; late anomalies are
    /// expected while channels wind down.
    pub fn publish(&self, event: SystemEvent) {
        if let Some(user) = &self.user
            && event != SystemEvent::Disconnect
        {
            user.on_system_event(&event);
        }
        let _ = self.fixer_tx.send(event);
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("user", &self.user.is_some())
            .finish()
    }
}
