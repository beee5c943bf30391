//! The fixer: recovery controller for a changing cluster
//!
//! A single worker task consumes the system-event inbox and turns
//! anomalies into corrective actions without ever blocking channel I/O.
//! Failed fixes move to a deadline-ordered backlog and retry with a
//! doubling delay; after [`MAX_REATTEMPTS`] the fixer gives up, tears the
//! client down and publishes an `UnexpectedFailure`.
//!
//! The loop also owns the dead-connection detector: whenever it wakes it
//! probes every channel for a producer that stopped talking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use riptide_protocol::{Status, StreamEndReason};
use tokio::sync::mpsc;

use crate::conductor::Conductor;
use crate::delay::{Delay, next_partition_backoff};
use crate::error::ClientError;
use crate::events::SystemEvent;

/// Give up on an event after this many fix attempts
pub const MAX_REATTEMPTS: u32 = 100;

/// Per-attempt timeout for config refreshes issued by the fixer
const CONFIG_PROVIDER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-attempt timeout for channel reconnects issued by the fixer
const DCP_CHANNEL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Zero total timeout: fixer-issued operations get a single attempt
const SINGLE_ATTEMPT: Duration = Duration::ZERO;

/// An event plus its retry bookkeeping
#[derive(Debug)]
struct Retryable {
    event: SystemEvent,
    attempts: u32,
    delay: Duration,
    ready_at: Instant,
}

impl Retryable {
    fn fresh(event: SystemEvent) -> Self {
        let delay = match &event {
            SystemEvent::OpenStreamFailed { delay, .. } => *delay,
            _ => Duration::ZERO,
        };
        Self {
            event,
            attempts: 0,
            delay,
            ready_at: Instant::now() + delay,
        }
    }
}

/// Single-threaded recovery worker
pub struct Fixer {
    conductor: Arc<Conductor>,
    inbox: mpsc::UnboundedReceiver<SystemEvent>,
    backlog: Vec<Retryable>,
    last_detection: Instant,
}

impl Fixer {
    pub fn new(conductor: Arc<Conductor>, inbox: mpsc::UnboundedReceiver<SystemEvent>) -> Self {
        Self {
            conductor,
            inbox,
            backlog: Vec::new(),
            last_detection: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        tracing::info!("fixer started");
        loop {
            let received = match self.next_wait() {
                Some(wait) => match tokio::time::timeout(wait, self.inbox.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.on_tick().await;
                        continue;
                    }
                },
                None => self.inbox.recv().await,
            };
            let Some(event) = received else { break };
            if event == SystemEvent::Disconnect {
                break;
            }
            let task = Retryable::fresh(event);
            if task.ready_at > Instant::now() {
                self.push_backlog(task);
            } else {
                self.handle(task).await;
            }
            self.drain_ready_backlog().await;
        }
        self.backlog.clear();
        tracing::info!("fixer stopped");
    }

    /// How long the loop may sleep before something needs attention
    fn next_wait(&self) -> Option<Duration> {
        let mut wait: Option<Duration> = None;
        let detection = self.conductor.config().dead_connection_detection_interval;
        if !detection.is_zero() {
            wait = Some(detection.saturating_sub(self.last_detection.elapsed()));
        }
        if let Some(next_failed) = self.backlog.iter().map(|task| task.ready_at).min() {
            let remaining = next_failed.saturating_duration_since(Instant::now());
            wait = Some(wait.map_or(remaining, |current| current.min(remaining)));
        }
        wait
    }

    async fn on_tick(&mut self) {
        self.drain_ready_backlog().await;
        let detection = self.conductor.config().dead_connection_detection_interval;
        if !detection.is_zero() && self.last_detection.elapsed() >= detection {
            self.last_detection = Instant::now();
            for channel in self.conductor.channels_snapshot() {
                channel.check_dead_connection(detection);
            }
        }
    }

    async fn drain_ready_backlog(&mut self) {
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .backlog
            .drain(..)
            .partition(|task| task.ready_at <= now);
        self.backlog = waiting;
        for task in ready {
            self.handle(task).await;
        }
    }

    fn push_backlog(&mut self, task: Retryable) {
        self.backlog.push(task);
    }

    /// Schedule a failed fix for another attempt, or give up
    async fn retry(&mut self, mut task: Retryable) {
        task.attempts += 1;
        if task.attempts > MAX_REATTEMPTS {
            tracing::warn!(event = %task.event, attempts = task.attempts, "fix attempts exhausted, giving up");
            self.give_up(format!(
                "{} not fixed after {} attempts",
                task.event, task.attempts
            ))
            .await;
            return;
        }
        task.delay = next_partition_backoff(task.delay);
        task.ready_at = Instant::now() + task.delay;
        tracing::debug!(event = %task.event, attempts = task.attempts, delay = ?task.delay, "scheduling retry");
        self.push_backlog(task);
    }

    async fn give_up(&mut self, cause: String) {
        self.conductor.disconnect(false).await;
        self.conductor
            .publish(SystemEvent::UnexpectedFailure { cause });
    }

    async fn handle(&mut self, task: Retryable) {
        if !self.conductor.is_connected() {
            return;
        }
        tracing::info!(event = %task.event, "handling");
        match &task.event {
            SystemEvent::ChannelDropped { .. } => self.fix_dropped_channel(task).await,
            SystemEvent::StreamEnd { .. } => self.fix_stream_end(task).await,
            SystemEvent::OpenStreamFailed { .. } => self.fix_open_stream(task).await,
            SystemEvent::Rollback { vbid, seqno } => {
                tracing::warn!(vbid, seqno, "rollback demanded, disconnecting client");
                // late frames are moot once a rollback is in play
                while self.inbox.try_recv().is_ok() {}
                self.backlog.clear();
                self.conductor.disconnect(false).await;
            }
            SystemEvent::UnexpectedFailure { .. } => {}
            SystemEvent::Disconnect => {}
        }
    }

    /// Refresh the config; distinguishes fatal bucket loss from blips
    async fn refresh_config(&self) -> Result<(), ClientError> {
        self.conductor
            .provider_refresh(
                CONFIG_PROVIDER_ATTEMPT_TIMEOUT,
                SINGLE_ATTEMPT,
                Delay::NONE,
            )
            .await
    }

    async fn fix_dropped_channel(&mut self, task: Retryable) {
        let SystemEvent::ChannelDropped { address } = task.event else {
            return;
        };
        match self.refresh_config().await {
            Ok(()) => {}
            Err(ClientError::BucketNotFound(bucket)) => {
                self.give_up(format!("bucket {bucket:?} disappeared")).await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "config refresh failed while fixing dropped channel");
                self.retry(task).await;
                return;
            }
        }

        let Some(channel) = self.conductor.channel_by_address(address) else {
            tracing::debug!(%address, "dropped channel already removed");
            return;
        };
        let bucket_config = self.conductor.bucket_config();
        if bucket_config.has_primary_partitions_on(address) {
            // a dead-connection report leaves the stale socket open
            if channel.state() != crate::channel::ChannelState::Disconnected {
                channel.disconnect(true).await;
            }
            match channel
                .connect(DCP_CHANNEL_ATTEMPT_TIMEOUT, SINGLE_ATTEMPT, Delay::NONE)
                .await
            {
                Ok(()) => {
                    channel.mark_dropped_reported(false);
                    tracing::info!(%address, "dropped channel reconnected");
                }
                Err(e) => {
                    tracing::warn!(%address, error = %e, "reconnect failed, orphaning streams");
                    self.orphan_streams(&channel);
                    self.conductor.remove_channel(address);
                }
            }
        } else {
            tracing::info!(%address, "node no longer owns vbuckets, removing channel");
            self.orphan_streams(&channel);
            self.conductor.remove_channel(address);
        }
    }

    /// Turn every stream still recorded on a dead channel into a
    /// recoverable stream-end
    fn orphan_streams(&self, channel: &crate::channel::DcpChannel) {
        let Ok(session) = self.conductor.session_state() else {
            return;
        };
        for vbid in channel.open_stream_vbids() {
            session
                .get(vbid)
                .set_phase(crate::state::PartitionPhase::Disconnected);
            self.conductor.publish(SystemEvent::StreamEnd {
                vbid,
                reason: StreamEndReason::ChannelDropped,
                failover_logs_requested: channel.failover_log_pending(vbid),
                seqnos_requested: !channel.is_state_fetched(),
            });
        }
    }

    async fn fix_stream_end(&mut self, task: Retryable) {
        let SystemEvent::StreamEnd {
            vbid,
            reason,
            failover_logs_requested,
            seqnos_requested,
        } = task.event
        else {
            return;
        };
        match reason {
            StreamEndReason::Closed => {
                tracing::info!(vbid, "stream stopped as requested");
            }
            StreamEndReason::Ok => {
                tracing::info!(vbid, "stream reached its requested end");
            }
            StreamEndReason::FilterEmpty => {
                tracing::info!(vbid, "stream filter empty, all filtered collections dropped");
            }
            StreamEndReason::LostPrivileges => {
                tracing::info!(vbid, "stream lost its privileges");
            }
            StreamEndReason::Disconnected => {
                tracing::warn!(vbid, "producer disconnecting, waiting for the channel drop");
            }
            StreamEndReason::TooSlow => {
                tracing::warn!(vbid, "consumer too slow for the producer, not repairing");
            }
            StreamEndReason::BackfillFail
            | StreamEndReason::StateChanged
            | StreamEndReason::ChannelDropped
            | StreamEndReason::Unknown(_) => {
                if let Err(ClientError::BucketNotFound(bucket)) = self.refresh_config().await {
                    self.give_up(format!("bucket {bucket:?} disappeared")).await;
                    return;
                }
                let bucket_config = self.conductor.bucket_config();
                match bucket_config.master_for(vbid) {
                    Some(address) => {
                        let connected = self
                            .conductor
                            .ensure_channel_connected(
                                address,
                                DCP_CHANNEL_ATTEMPT_TIMEOUT,
                                SINGLE_ATTEMPT,
                                Delay::NONE,
                            )
                            .await;
                        let channel = match connected {
                            Ok(channel) => channel,
                            Err(e) => {
                                tracing::warn!(vbid, %address, error = %e, "cannot reach new master");
                                self.retry(task).await;
                                return;
                            }
                        };
                        tracing::info!(vbid, %address, "found a master for the vbucket");
                        if failover_logs_requested {
                            channel.get_failover_log(vbid);
                        }
                        if seqnos_requested {
                            channel.get_seqnos();
                        }
                        if let Err(e) = self.restart_stream(vbid) {
                            tracing::warn!(vbid, error = %e, "stream restart failed");
                            self.retry(task).await;
                        }
                    }
                    None => {
                        tracing::info!(vbid, "vbucket has no master at the moment");
                        self.retry(task).await;
                    }
                }
            }
            StreamEndReason::Rollback => {
                tracing::error!(vbid, "stream ended for a rollback; expecting a rollback response");
            }
        }
    }

    async fn fix_open_stream(&mut self, task: Retryable) {
        let SystemEvent::OpenStreamFailed { vbid, status, .. } = task.event else {
            return;
        };
        match status {
            Status::InvalidArguments => {
                let request = self
                    .conductor
                    .session_state()
                    .ok()
                    .and_then(|session| session.get(vbid).pending_stream_request());
                self.give_up(format!(
                    "stream open rejected with invalid arguments: {request:?}"
                ))
                .await;
            }
            Status::ManifestIsAhead => {
                // the scheduling delay already covered the event's backoff
                if let Err(e) = self.restart_stream(vbid) {
                    tracing::warn!(vbid, error = %e, "manifest-ahead restart failed");
                    self.retry(task).await;
                }
            }
            _ => {
                if let Err(ClientError::BucketNotFound(bucket)) = self.refresh_config().await {
                    self.give_up(format!("bucket {bucket:?} disappeared")).await;
                    return;
                }
                let bucket_config = self.conductor.bucket_config();
                let Some(address) = bucket_config.master_for(vbid) else {
                    self.retry(task).await;
                    return;
                };
                let connected = self
                    .conductor
                    .ensure_channel_connected(
                        address,
                        DCP_CHANNEL_ATTEMPT_TIMEOUT,
                        SINGLE_ATTEMPT,
                        Delay::NONE,
                    )
                    .await;
                match connected {
                    Ok(_) => {
                        if let Err(e) = self.restart_stream(vbid) {
                            tracing::warn!(vbid, error = %e, "stream restart failed");
                            self.retry(task).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(vbid, %address, error = %e, "cannot reach master");
                        self.retry(task).await;
                    }
                }
            }
        }
    }

    fn restart_stream(&self, vbid: u16) -> Result<(), ClientError> {
        let session = self.conductor.session_state()?;
        let request = session
            .get(vbid)
            .prepare_next_stream_request(&session.default_stream());
        self.conductor.start_stream_for_partition(&request)
    }
}
