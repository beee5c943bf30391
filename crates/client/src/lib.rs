//! Riptide — streaming client core for Couchbase's Database Change
//! Protocol (DCP)
//!
//! DCP delivers an ordered-by-seqno stream of mutations, deletions,
//! expirations and system events per vbucket of a bucket. This crate
//! bootstraps against a cluster map, opens one multiplexed connection
//! per master node, drives the per-partition stream state machines,
//! persists session state for resumption and transparently recovers from
//! rebalance, rollback and dead connections.
//!
//! # Architecture
//!
//! - [`state`] — per-vbucket session slices, stream requests, persistence
//! - [`channel`] — one connection per KV node: connect/auth/negotiate,
//!   frame demultiplexing, dead-connection probing
//! - [`conductor`] — the orchestrator owning session state and channels
//! - [`fixer`] — the single-threaded recovery controller
//! - [`flow`] — per-connection buffer-ack accounting
//!
//! # Contracts
//!
//! Data and control callbacks run on the owning channel's I/O task and
//! must not block. Every delivered frame carries an [`AckHandle`] that
//! must be acked exactly once, even when the payload is discarded.
//! Ordering is guaranteed within a vbucket only; the client never
//! deduplicates and never buffers beyond the flow-control window.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use riptide_client::{ClientConfig, Conductor, StaticCredentials};
//!
//! let conductor = Conductor::new(
//!     ClientConfig::new("travel-sample"),
//!     provider,
//!     Arc::new(StaticCredentials::new("reader", "password")),
//!     data_handler,
//!     control_handler,
//!     None,
//! )?;
//! conductor.connect().await?;
//! conductor.start_streaming().await?;
//! ```

pub mod channel;
pub mod conductor;
pub mod config;
pub mod delay;
pub mod error;
pub mod events;
pub mod fixer;
pub mod flow;
pub mod handler;
pub mod provider;
pub mod state;
pub mod test;

pub use channel::{ChannelState, DcpChannel};
pub use conductor::Conductor;
pub use config::{ClientConfig, NetworkResolution, SslConfig};
pub use delay::Delay;
pub use error::{ClientError, Result};
pub use events::SystemEvent;
pub use flow::FlowController;
pub use handler::{
    AckHandle, ControlEvent, ControlEventHandler, DataEventHandler, SystemEventHandler,
};
pub use provider::{BucketConfig, ConfigProvider, CredentialsProvider, StaticCredentials};
pub use state::{
    NO_END_SEQNO, PartitionPhase, PartitionState, SessionSnapshot, SessionState, StreamRequest,
    StreamState,
};

// wire-level types embedders handle in callbacks
pub use riptide_protocol::{
    DataEvent, DataKind, FailoverEntry, SnapshotMarker, Status, StreamEndReason, SystemEventKind,
    SystemEventMessage,
};
