//! Memcached binary protocol surface for the riptide DCP client
//!
//! This crate carries exactly the wire surface the streaming core consumes:
//! the 24-byte binary header, frame splitting, typed request encoders and
//! typed response/message views. Document bodies are never interpreted.
//!
//! # Wire Format
//!
//! Every frame starts with a fixed 24-byte header:
//! ```text
//! ┌───────┬────────┬─────────┬────────────┬───────────┬──────────────┐
//! │ magic │ opcode │ key len │ extras len │ data type │ vbucket /    │
//! │ (1)   │ (1)    │ (2)     │ (1)        │ (1)       │ status (2)   │
//! ├───────┴────────┴─────────┴────────────┴───────────┴──────────────┤
//! │ total body length (4)                                            │
//! │ opaque (4)                                                       │
//! │ cas (8)                                                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The body is `[framing extras][extras][key][value]`, all lengths taken
//! from the header. Flexible-framing magics (0x08/0x18) are accepted on
//! decode; their framing extras are skipped, never interpreted.

mod codec;
mod error;
mod header;
mod opcode;
pub mod request;
mod status;
mod stream_end;
pub mod view;

pub use codec::{DcpCodec, Frame, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use header::{FrameHeader, HEADER_SIZE, MAGIC_REQ, MAGIC_REQ_FLEX, MAGIC_RES, MAGIC_RES_FLEX};
pub use opcode::Opcode;
pub use status::Status;
pub use stream_end::StreamEndReason;
pub use view::{
    DataEvent, DataKind, FailoverEntry, OsoSnapshot, SnapshotMarker, SystemEventKind,
    SystemEventMessage,
};
