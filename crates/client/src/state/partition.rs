//! Per-partition stream state
//!
//! One value per vbucket, created at session init and destroyed at
//! shutdown. Scalar fields are atomics written only from the owning
//! channel's I/O task; the failover log and pending request sit behind a
//! short mutex. Waiters observe phase transitions through a watch channel
//! and request milestones through [`Signal`] slots.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use riptide_protocol::FailoverEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::delay::next_partition_backoff;
use crate::error::Result;
use crate::state::request::StreamRequest;
use crate::state::session::StreamState;
use crate::state::signal::Signal;

/// Sentinel end-seqno for open-ended streams
pub const NO_END_SEQNO: u64 = u64::MAX;

/// Connection sub-state of one partition's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionPhase {
    Disconnected,
    Connecting,
    Connected { node: SocketAddr },
    Disconnecting,
}

impl PartitionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Streaming or about to stream; a second stream-open is a no-op
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Connecting)
    }
}

#[derive(Debug, Default)]
struct PartitionInner {
    failover_log: Vec<FailoverEntry>,
    pending_request: Option<StreamRequest>,
    backoff: Duration,
}

/// Durable session slice for one vbucket
#[derive(Debug)]
pub struct PartitionState {
    vbid: u16,
    phase: watch::Sender<PartitionPhase>,
    seqno: AtomicU64,
    snapshot_start: AtomicU64,
    snapshot_end: AtomicU64,
    stream_end_seqno: AtomicU64,
    /// Last sampled remote high-watermark; max-wins from snapshot markers
    /// and GET_ALL_VB_SEQNOS alike
    master_seqno: AtomicU64,
    manifest_uid: AtomicU64,
    oso_active: AtomicBool,
    oso_max_seqno: AtomicU64,
    client_disconnected: AtomicBool,
    failover_signal: Signal,
    inner: Mutex<PartitionInner>,
}

impl PartitionState {
    pub fn new(vbid: u16) -> Self {
        let (phase, _) = watch::channel(PartitionPhase::Disconnected);
        Self {
            vbid,
            phase,
            seqno: AtomicU64::new(0),
            snapshot_start: AtomicU64::new(0),
            snapshot_end: AtomicU64::new(0),
            stream_end_seqno: AtomicU64::new(NO_END_SEQNO),
            master_seqno: AtomicU64::new(0),
            manifest_uid: AtomicU64::new(0),
            oso_active: AtomicBool::new(false),
            oso_max_seqno: AtomicU64::new(0),
            client_disconnected: AtomicBool::new(false),
            failover_signal: Signal::new("failover log"),
            inner: Mutex::new(PartitionInner::default()),
        }
    }

    pub fn vbid(&self) -> u16 {
        self.vbid
    }

    // ------------------------------------------------------------------
    // Phase
    // ------------------------------------------------------------------

    pub fn phase(&self) -> PartitionPhase {
        *self.phase.borrow()
    }

    pub fn set_phase(&self, phase: PartitionPhase) {
        self.phase.send_replace(phase);
    }

    /// Block until the partition reaches the given phase discriminant
    pub async fn wait_for_phase(&self, wanted: PartitionPhase, timeout: Duration) -> Result<()> {
        let mut rx = self.phase.subscribe();
        let result = tokio::time::timeout(
            timeout,
            rx.wait_for(|phase| std::mem::discriminant(phase) == std::mem::discriminant(&wanted)),
        )
        .await;
        match result {
            Err(_) => Err(crate::error::ClientError::Timeout {
                operation: "partition phase change",
                elapsed: timeout,
            }),
            Ok(Err(_)) => Err(crate::error::ClientError::Disconnected {
                operation: "partition phase change",
            }),
            Ok(Ok(_)) => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Sequence numbers and snapshot window
    // ------------------------------------------------------------------

    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    /// Record a delivered by-seqno
    ///
    /// Inside an OSO window only the window maximum advances; the real
    /// seqno is promoted once on window end.
    pub fn set_seqno(&self, seqno: u64) {
        if self.oso_active.load(Ordering::Acquire) {
            self.oso_max_seqno.fetch_max(seqno, Ordering::AcqRel);
            return;
        }
        let previous = self.seqno.load(Ordering::Acquire);
        if seqno <= previous {
            tracing::warn!(
                vbid = self.vbid,
                new = format_args!("0x{seqno:x}"),
                previous = format_args!("0x{previous:x}"),
                "received seqno does not advance"
            );
        }
        self.seqno.store(seqno, Ordering::Release);
    }

    /// Jump the seqno and collapse the snapshot window onto it
    pub fn advance_seqno(&self, seqno: u64) {
        self.seqno.store(seqno, Ordering::Release);
        self.snapshot_start.store(seqno, Ordering::Release);
        self.snapshot_end.store(seqno, Ordering::Release);
        self.master_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    pub fn snapshot_start_seqno(&self) -> u64 {
        self.snapshot_start.load(Ordering::Acquire)
    }

    pub fn snapshot_end_seqno(&self) -> u64 {
        self.snapshot_end.load(Ordering::Acquire)
    }

    /// Apply a snapshot marker; consumes the pending stream request
    pub fn set_snapshot(&self, start: u64, end: u64) {
        self.use_stream_request();
        self.snapshot_start.store(start, Ordering::Release);
        self.snapshot_end.store(end, Ordering::Release);
        self.master_seqno.fetch_max(end, Ordering::AcqRel);
    }

    pub fn stream_end_seqno(&self) -> u64 {
        self.stream_end_seqno.load(Ordering::Acquire)
    }

    pub fn set_stream_end_seqno(&self, seqno: u64) {
        self.stream_end_seqno.store(seqno, Ordering::Release);
    }

    pub fn master_seqno(&self) -> u64 {
        self.master_seqno.load(Ordering::Acquire)
    }

    /// Fold in a remote high-watermark sample (max-wins)
    pub fn observe_master_seqno(&self, seqno: u64) {
        self.master_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    pub fn manifest_uid(&self) -> u64 {
        self.manifest_uid.load(Ordering::Acquire)
    }

    /// Apply an in-stream system event: advances the seqno and the
    /// collection manifest id together
    pub fn on_system_event(&self, seqno: u64, manifest_uid: u64) {
        self.set_seqno(seqno);
        self.manifest_uid.store(manifest_uid, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Out-of-order snapshots
    // ------------------------------------------------------------------

    pub fn oso_active(&self) -> bool {
        self.oso_active.load(Ordering::Acquire)
    }

    pub fn oso_max_seqno(&self) -> u64 {
        self.oso_max_seqno.load(Ordering::Acquire)
    }

    pub fn begin_out_of_order(&self) {
        self.oso_max_seqno.store(0, Ordering::Release);
        self.oso_active.store(true, Ordering::Release);
    }

    /// Close the OSO window, promoting its maximum to the real seqno
    pub fn end_out_of_order(&self) -> u64 {
        self.use_stream_request();
        self.oso_active.store(false, Ordering::Release);
        let max = self.oso_max_seqno.load(Ordering::Acquire);
        self.advance_seqno(max);
        max
    }

    // ------------------------------------------------------------------
    // Failover log
    // ------------------------------------------------------------------

    pub fn failover_log(&self) -> Vec<FailoverEntry> {
        self.inner.lock().expect("partition inner").failover_log.clone()
    }

    /// Replace the failover history (oldest→newest) and wake waiters
    pub fn failover_updated(&self, entries: Vec<FailoverEntry>) {
        self.inner.lock().expect("partition inner").failover_log = entries;
        self.failover_signal.complete();
    }

    /// Newest uuid, presented in stream requests; zero before any history
    pub fn uuid(&self) -> u64 {
        self.inner
            .lock()
            .expect("partition inner")
            .failover_log
            .last()
            .map_or(0, |entry| entry.uuid)
    }

    /// Drop the history, e.g. when reconnecting after a rollback
    pub fn clear_failover_log(&self) {
        self.inner.lock().expect("partition inner").failover_log.clear();
    }

    pub fn failover_requested(&self) {
        self.failover_signal.begin();
    }

    pub fn failover_request_failed(&self, reason: impl Into<String>) {
        self.failover_signal.fail(reason);
    }

    pub async fn wait_failover_updated(&self, timeout: Duration) -> Result<()> {
        self.failover_signal.wait(timeout).await
    }

    // ------------------------------------------------------------------
    // Stream requests
    // ------------------------------------------------------------------

    /// Install a request, adopting its positions as current state
    pub fn set_stream_request(&self, request: StreamRequest) {
        self.seqno.store(request.start_seqno, Ordering::Release);
        self.stream_end_seqno
            .store(request.end_seqno, Ordering::Release);
        self.snapshot_start
            .store(request.snapshot_start_seqno, Ordering::Release);
        self.snapshot_end
            .store(request.snapshot_end_seqno, Ordering::Release);
        self.manifest_uid
            .store(request.manifest_uid, Ordering::Release);
        self.inner.lock().expect("partition inner").pending_request = Some(request);
    }

    /// Build the next request from the current position, unless one is
    /// already pending
    ///
    /// The snapshot start is clamped down to the seqno, and a finite end
    /// seqno that fell behind the position is moved to the snapshot end.
    pub fn prepare_next_stream_request(&self, stream: &StreamState) -> StreamRequest {
        let mut inner = self.inner.lock().expect("partition inner");
        if let Some(pending) = &inner.pending_request {
            return pending.clone();
        }
        let seqno = self.seqno();
        let mut snapshot_start = self.snapshot_start_seqno();
        if snapshot_start > seqno {
            snapshot_start = seqno;
            self.snapshot_start.store(snapshot_start, Ordering::Release);
        }
        let mut end_seqno = self.stream_end_seqno();
        if end_seqno != NO_END_SEQNO && end_seqno < seqno {
            end_seqno = self.snapshot_end_seqno();
            self.stream_end_seqno.store(end_seqno, Ordering::Release);
        }
        let request = StreamRequest {
            vbid: self.vbid,
            start_seqno: seqno,
            end_seqno,
            vbuuid: inner.failover_log.last().map_or(0, |entry| entry.uuid),
            snapshot_start_seqno: snapshot_start,
            snapshot_end_seqno: self.snapshot_end_seqno(),
            manifest_uid: self.manifest_uid(),
            stream_id: stream.stream_id,
            collection_id: stream.collection_id,
        };
        inner.pending_request = Some(request.clone());
        request
    }

    pub fn pending_stream_request(&self) -> Option<StreamRequest> {
        self.inner
            .lock()
            .expect("partition inner")
            .pending_request
            .clone()
    }

    /// Consume the pending request once the server honoured it
    pub fn use_stream_request(&self) {
        self.inner.lock().expect("partition inner").pending_request = None;
    }

    // ------------------------------------------------------------------
    // Backoff
    // ------------------------------------------------------------------

    pub fn current_backoff(&self) -> Duration {
        self.inner.lock().expect("partition inner").backoff
    }

    /// Advance the backoff schedule; returns the new delay
    pub fn record_open_failure(&self) -> Duration {
        let mut inner = self.inner.lock().expect("partition inner");
        inner.backoff = next_partition_backoff(inner.backoff);
        inner.backoff
    }

    /// Reset the backoff after a successful stream open
    pub fn record_open_success(&self) {
        self.inner.lock().expect("partition inner").backoff = Duration::ZERO;
    }

    // ------------------------------------------------------------------
    // Disconnect plumbing
    // ------------------------------------------------------------------

    pub fn is_client_disconnected(&self) -> bool {
        self.client_disconnected.load(Ordering::Acquire)
    }

    /// Flip the client-disconnected flag, cancelling or re-arming waits
    pub fn set_client_disconnected(&self, disconnected: bool) {
        self.client_disconnected
            .store(disconnected, Ordering::Release);
        if disconnected {
            self.failover_signal.cancel();
        } else {
            self.failover_signal.reset();
        }
    }
}

#[cfg(test)]
#[path = "partition_test.rs"]
mod tests;
