//! Durable session state: one slice per partition plus stream metadata

mod partition;
mod request;
mod session;
mod signal;

pub use partition::{NO_END_SEQNO, PartitionPhase, PartitionState};
pub use request::StreamRequest;
pub use session::{
    PartitionSnapshot, SessionSnapshot, SessionState, StreamSnapshot, StreamState,
};
pub use signal::Signal;
