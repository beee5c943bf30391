//! Session state: the partition array plus stream metadata
//!
//! Serialisable for resumption. A persisted session reloaded into a new
//! client resumes every partition at its stored seqno with its stored
//! failover history.

use std::sync::Arc;

use riptide_protocol::FailoverEntry;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::state::partition::{PartitionPhase, PartitionState};

/// Metadata of one logical stream over the bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub stream_id: u16,
    /// Collection filter; `None` streams the whole bucket
    pub collection_id: Option<u32>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            stream_id: 0,
            collection_id: None,
        }
    }
}

/// All per-partition state for one client instance
#[derive(Debug)]
pub struct SessionState {
    partitions: Vec<Arc<PartitionState>>,
    streams: Vec<StreamState>,
}

impl SessionState {
    pub fn new(num_partitions: u16) -> Self {
        Self::with_streams(num_partitions, vec![StreamState::default()])
    }

    pub fn with_streams(num_partitions: u16, streams: Vec<StreamState>) -> Self {
        let partitions = (0..num_partitions)
            .map(|vbid| Arc::new(PartitionState::new(vbid)))
            .collect();
        Self { partitions, streams }
    }

    pub fn num_partitions(&self) -> u16 {
        self.partitions.len() as u16
    }

    pub fn get(&self, vbid: u16) -> &Arc<PartitionState> {
        &self.partitions[usize::from(vbid)]
    }

    pub fn partitions(&self) -> &[Arc<PartitionState>] {
        &self.partitions
    }

    pub fn streams(&self) -> &[StreamState] {
        &self.streams
    }

    /// The stream new partition requests are prepared against
    pub fn default_stream(&self) -> StreamState {
        self.streams.first().copied().unwrap_or_default()
    }

    /// Propagate connect/disconnect to every partition's wait plumbing
    pub fn set_client_disconnected(&self, disconnected: bool) {
        for partition in &self.partitions {
            partition.set_client_disconnected(disconnected);
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            partitions: self
                .partitions
                .iter()
                .map(|partition| PartitionSnapshot {
                    vbid: partition.vbid(),
                    max_seq: partition.master_seqno(),
                    uuid: partition.uuid(),
                    seqno: partition.seqno(),
                    state: partition.phase(),
                    failover_log: partition.failover_log(),
                })
                .collect(),
            streams: self
                .streams
                .iter()
                .map(|stream| StreamSnapshot {
                    stream_id: stream.stream_id,
                    collection_id: stream.collection_id,
                })
                .collect(),
        }
    }

    /// Rebuild a session from a snapshot
    ///
    /// Runtime phases reset to disconnected; positions, uuid history and
    /// remote high-watermarks carry over, with the snapshot window
    /// collapsed onto the seqno so the next stream request resumes
    /// exactly there.
    pub fn restore(snapshot: &SessionSnapshot) -> Self {
        let partitions: Vec<Arc<PartitionState>> = snapshot
            .partitions
            .iter()
            .map(|saved| {
                let partition = PartitionState::new(saved.vbid);
                partition.advance_seqno(saved.seqno);
                partition.observe_master_seqno(saved.max_seq);
                if !saved.failover_log.is_empty() {
                    partition.failover_updated(saved.failover_log.clone());
                }
                Arc::new(partition)
            })
            .collect();
        let streams = snapshot
            .streams
            .iter()
            .map(|saved| StreamState {
                stream_id: saved.stream_id,
                collection_id: saved.collection_id,
            })
            .collect();
        Self { partitions, streams }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.snapshot())
            .map_err(|e| ClientError::InvalidState(format!("session serialisation failed: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: SessionSnapshot = serde_json::from_str(json)
            .map_err(|e| ClientError::InvalidState(format!("session deserialisation failed: {e}")))?;
        Ok(Self::restore(&snapshot))
    }
}

/// Serialised shape of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub partitions: Vec<PartitionSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

/// Serialised shape of one partition slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub vbid: u16,
    #[serde(rename = "maxSeq")]
    pub max_seq: u64,
    pub uuid: u64,
    pub seqno: u64,
    pub state: PartitionPhase,
    #[serde(rename = "failoverLog")]
    pub failover_log: Vec<FailoverEntry>,
}

/// Serialised shape of one stream's metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    #[serde(rename = "streamId")]
    pub stream_id: u16,
    #[serde(rename = "collectionId")]
    pub collection_id: Option<u32>,
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
