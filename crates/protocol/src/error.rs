//! Error types for frame encode/decode

use thiserror::Error;

/// Errors produced while framing or interpreting wire messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error bubbled up from the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// First byte of a frame is not a known magic
    #[error("invalid magic byte 0x{0:02x}")]
    InvalidMagic(u8),

    /// Declared body length exceeds the frame size limit
    #[error("frame of {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Header lengths are inconsistent with the total body length
    #[error("inconsistent header: {reason}")]
    InvalidHeader { reason: &'static str },

    /// A message section ended before the expected field
    #[error("truncated {what}")]
    Truncated { what: &'static str },
}
