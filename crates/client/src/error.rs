//! Error types for the streaming client
//!
//! Protocol status codes never surface here: the channel layer routes them
//! as events. These errors cover transport setup, caller-facing waits and
//! configuration mistakes.

use std::net::SocketAddr;
use std::time::Duration;

use riptide_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the conductor, channels and waits
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error on a channel socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-level error from the codec
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// SASL authentication was rejected by the node
    #[error("authentication failed against {address}: {reason}")]
    Authentication { address: SocketAddr, reason: String },

    /// The configured bucket does not exist on the cluster
    #[error("bucket {0:?} not found")]
    BucketNotFound(String),

    /// A DCP_OPEN or DCP_CONTROL negotiation step was rejected
    #[error("connection negotiation rejected: {step} returned {status}")]
    NegotiationRejected { step: &'static str, status: String },

    /// Operation requires a connected channel
    #[error("channel to {address} is not connected")]
    NotConnected { address: SocketAddr },

    /// Channel or conductor is in the wrong state for the call
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration rejected at construction
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A wait operation ran out of time
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The client disconnected while a caller was waiting
    #[error("client disconnected while waiting for {operation}")]
    Disconnected { operation: &'static str },

    /// The current bucket config has no master for the partition
    #[error("no master node for vbucket {vbid}")]
    NoMaster { vbid: u16 },

    /// No channel exists for the node that owns the partition
    #[error("no channel for node {address}")]
    NoChannel { address: SocketAddr },

    /// A request-response operation failed on the wire
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Connect retry window exhausted without success
    #[error("connection to {address} failed after {attempts} attempts: {last_error}")]
    ConnectFailed {
        address: SocketAddr,
        attempts: u32,
        last_error: String,
    },

    /// Config provider could not produce a usable bucket config
    #[error("config provider failed: {0}")]
    ConfigProvider(String),
}
