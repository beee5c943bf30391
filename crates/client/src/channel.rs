//! One DCP connection to a KV node
//!
//! A channel owns the socket, a writer task fed over an unbounded queue,
//! and a reader task that splits frames and demultiplexes them onto
//! partition state, user callbacks and the system-event bus. All channel
//! bitsets are touched only behind the channel's own lock; only
//! aggregated queries are exposed.
//!
//! # Connect sequence
//!
//! TCP (+ keepalive/nodelay) → SASL LIST_MECHS → SASL AUTH (PLAIN) →
//! DCP_OPEN → DCP_CONTROL negotiation. The connect call retries whole
//! attempts until the total timeout runs out, then returns the first
//! captured failure. After a successful connect every stream previously
//! recorded open is re-requested from its stored position.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use riptide_protocol::{
    DataKind, DcpCodec, Frame, Opcode, ProtocolError, Status, StreamEndReason, request, view,
};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::delay::Delay;
use crate::error::{ClientError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::flow::FlowController;
use crate::handler::{AckHandle, ControlEvent, ControlEventHandler, DataEventHandler};
use crate::provider::CredentialsProvider;
use crate::state::{PartitionPhase, SessionState, Signal, StreamRequest};

/// Read buffer size when buffer pooling is on (1MB)
const POOLED_READ_BUFFER: usize = 1024 * 1024;

/// Read buffer size when buffer pooling is off
const UNPOOLED_READ_BUFFER: usize = 16 * 1024;

/// Noop interval negotiated with the producer, in seconds
const NOOP_INTERVAL_SECS: u64 = 120;

/// Connection state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
struct ChannelInner {
    /// Which vbuckets are streaming on this channel
    open_streams: Bitset,
    /// Which vbuckets have a failover-log request in flight
    failover_pending: Bitset,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    lifecycle: Option<CancellationToken>,
}

/// Logical DCP connection to one KV node
pub struct DcpChannel {
    address: SocketAddr,
    config: Arc<ClientConfig>,
    session: Arc<SessionState>,
    credentials: Arc<dyn CredentialsProvider>,
    data_handler: Arc<dyn DataEventHandler>,
    control_handler: Arc<dyn ControlEventHandler>,
    events: EventBus,
    flow: Arc<FlowController>,
    state: watch::Sender<ChannelState>,
    /// Set once a GET_ALL_VB_SEQNOS response has been applied
    state_fetched: watch::Sender<bool>,
    dropped_reported: AtomicBool,
    last_rx: Mutex<Instant>,
    manifest: Mutex<Option<Bytes>>,
    manifest_signal: Signal,
    inner: Mutex<ChannelInner>,
}

impl DcpChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: SocketAddr,
        config: Arc<ClientConfig>,
        session: Arc<SessionState>,
        credentials: Arc<dyn CredentialsProvider>,
        data_handler: Arc<dyn DataEventHandler>,
        control_handler: Arc<dyn ControlEventHandler>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let flow = FlowController::new(
            config.flow_control_buffer_size,
            config.buffer_ack_watermark_percent,
        )?;
        let num_partitions = session.num_partitions();
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (state_fetched, _) = watch::channel(true);
        Ok(Arc::new(Self {
            address,
            config,
            session,
            credentials,
            data_handler,
            control_handler,
            events,
            flow: Arc::new(flow),
            state,
            state_fetched,
            dropped_reported: AtomicBool::new(false),
            last_rx: Mutex::new(Instant::now()),
            manifest: Mutex::new(None),
            manifest_signal: Signal::new("collections manifest"),
            inner: Mutex::new(ChannelInner {
                open_streams: Bitset::new(usize::from(num_partitions)),
                failover_pending: Bitset::new(usize::from(num_partitions)),
                writer: None,
                lifecycle: None,
            }),
        }))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn is_state_fetched(&self) -> bool {
        *self.state_fetched.borrow()
    }

    pub fn state_fetched_watch(&self) -> watch::Receiver<bool> {
        self.state_fetched.subscribe()
    }

    /// vbuckets currently streaming here
    pub fn open_stream_vbids(&self) -> Vec<u16> {
        self.inner.lock().expect("channel inner").open_streams.ones()
    }

    pub fn has_open_streams(&self) -> bool {
        self.inner.lock().expect("channel inner").open_streams.any()
    }

    pub fn stream_is_open(&self, vbid: u16) -> bool {
        self.inner
            .lock()
            .expect("channel inner")
            .open_streams
            .get(usize::from(vbid))
    }

    pub fn failover_log_pending(&self, vbid: u16) -> bool {
        self.inner
            .lock()
            .expect("channel inner")
            .failover_pending
            .get(usize::from(vbid))
    }

    pub fn mark_dropped_reported(&self, reported: bool) {
        self.dropped_reported.store(reported, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------

    /// Establish the connection, retrying whole attempts
    ///
    /// A zero `total_timeout` means a single attempt. On success every
    /// stream recorded open is re-opened from its partition's stored
    /// position, pending failover-log requests are re-issued, and seqnos
    /// are re-sampled if they were never fetched.
    pub async fn connect(
        self: &Arc<Self>,
        attempt_timeout: Duration,
        total_timeout: Duration,
        delay: Delay,
    ) -> Result<()> {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Disconnected {
                *state = ChannelState::Connecting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return Err(ClientError::InvalidState(format!(
                "channel to {} is already {:?}",
                self.address,
                self.state()
            )));
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut first_failure: Option<ClientError> = None;
        loop {
            if self.state() != ChannelState::Connecting {
                return Err(ClientError::Disconnected {
                    operation: "channel connect",
                });
            }
            attempt += 1;
            tracing::debug!(address = %self.address, attempt, "DCP channel connect attempt");
            match self.try_connect(attempt_timeout).await {
                Ok(stream) => {
                    self.install(stream);
                    let mut still_connecting = false;
                    self.state.send_if_modified(|state| {
                        if *state == ChannelState::Connecting {
                            *state = ChannelState::Connected;
                            still_connecting = true;
                        }
                        still_connecting
                    });
                    if !still_connecting {
                        // disconnected while handshaking; drop the socket
                        let token = self.inner.lock().expect("channel inner").lifecycle.clone();
                        if let Some(token) = token {
                            token.cancel();
                        }
                        return Err(ClientError::Disconnected {
                            operation: "channel connect",
                        });
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(address = %self.address, attempt, error = %e, "connect attempt failed");
                    let first = first_failure.get_or_insert(e);
                    if total_timeout.is_zero() || started.elapsed() > total_timeout {
                        let last_error = first.to_string();
                        self.state.send_replace(ChannelState::Disconnected);
                        return Err(ClientError::ConnectFailed {
                            address: self.address,
                            attempts: attempt,
                            last_error,
                        });
                    }
                    tokio::time::sleep(delay.calculate(attempt)).await;
                }
            }
        }

        tracing::info!(address = %self.address, attempt, "DCP channel connected");

        // restart everything that was live before the connection died
        let (reopen, refetch) = {
            let inner = self.inner.lock().expect("channel inner");
            (inner.open_streams.ones(), inner.failover_pending.ones())
        };
        for vbid in reopen {
            tracing::debug!(vbid, "re-opening stream after reconnect");
            let partition = self.session.get(vbid);
            let request = partition.prepare_next_stream_request(&self.session.default_stream());
            self.open_stream(&request);
        }
        for vbid in refetch {
            tracing::debug!(vbid, "re-requesting failover log after reconnect");
            self.get_failover_log(vbid);
        }
        if !self.is_state_fetched() {
            self.get_seqnos();
        }
        Ok(())
    }

    async fn try_connect(self: &Arc<Self>, attempt_timeout: Duration) -> Result<TcpStream> {
        let connected = tokio::time::timeout(attempt_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| ClientError::Timeout {
                operation: "tcp connect",
                elapsed: attempt_timeout,
            })??;
        self.configure_socket(&connected);

        let mut stream = connected;
        match tokio::time::timeout(attempt_timeout, self.handshake(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Timeout {
                    operation: "dcp handshake",
                    elapsed: attempt_timeout,
                });
            }
        }
        Ok(stream)
    }

    fn configure_socket(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address = %self.address, error = %e, "failed to set TCP_NODELAY");
        }
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            tracing::debug!(address = %self.address, error = %e, "failed to set TCP keepalive");
        }
    }

    /// SASL + DCP_OPEN + control negotiation, in lockstep
    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        write_frame(stream, request::sasl_list_mechs()).await?;
        let mechs = read_frame(stream).await?;
        let offered = String::from_utf8_lossy(&mechs.value()).to_string();
        if !offered.split_whitespace().any(|mech| mech == "PLAIN") {
            return Err(ClientError::Authentication {
                address: self.address,
                reason: format!("PLAIN not offered (server offers {offered:?})"),
            });
        }

        let (username, password) = self.credentials.credentials();
        write_frame(stream, request::sasl_auth_plain(&username, &password)).await?;
        let auth = read_frame(stream).await?;
        let auth_status = Status::from_u16(auth.header.status());
        if !auth_status.is_success() {
            return Err(ClientError::Authentication {
                address: self.address,
                reason: auth_status.to_string(),
            });
        }

        let name = self.connection_name();
        write_frame(stream, request::dcp_open(&name, request::OPEN_FLAG_PRODUCER)).await?;
        let opened = read_frame(stream).await?;
        let open_status = Status::from_u16(opened.header.status());
        if !open_status.is_success() {
            return Err(ClientError::NegotiationRejected {
                step: "DCP_OPEN",
                status: open_status.to_string(),
            });
        }

        let mut controls: Vec<(String, String)> = Vec::new();
        if self.flow.enabled() {
            controls.push((
                "connection_buffer_size".into(),
                self.flow.buffer_size().to_string(),
            ));
        }
        controls.push(("enable_noop".into(), "true".into()));
        controls.push(("set_noop_interval".into(), NOOP_INTERVAL_SECS.to_string()));
        for (key, value) in &self.config.control_params {
            controls.push((key.clone(), value.clone()));
        }
        for (key, value) in controls {
            write_frame(stream, request::dcp_control(&key, &value)).await?;
            let reply = read_frame(stream).await?;
            let status = Status::from_u16(reply.header.status());
            if !status.is_success() {
                return Err(ClientError::NegotiationRejected {
                    step: "DCP_CONTROL",
                    status: format!("{key}={value} rejected with {status}"),
                });
            }
        }
        Ok(())
    }

    fn connection_name(&self) -> String {
        self.config.connection_name.clone().unwrap_or_else(|| {
            format!(
                "riptide/{}/{}/{}",
                self.config.bucket,
                std::process::id(),
                self.address
            )
        })
    }

    /// Wire up reader/writer tasks on a handshaked stream
    fn install(self: &Arc<Self>, stream: TcpStream) {
        let token = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = stream.into_split();
        {
            let mut inner = self.inner.lock().expect("channel inner");
            inner.writer = Some(writer_tx);
            inner.lifecycle = Some(token.clone());
        }
        *self.last_rx.lock().expect("last rx") = Instant::now();

        tokio::spawn(writer_task(
            self.address,
            write_half,
            writer_rx,
            token.clone(),
        ));
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.reader_task(read_half, token).await });
    }

    async fn reader_task(self: Arc<Self>, mut read_half: OwnedReadHalf, token: CancellationToken) {
        let capacity = if self.config.pool_buffers {
            POOLED_READ_BUFFER
        } else {
            UNPOOLED_READ_BUFFER
        };
        let mut buf = BytesMut::with_capacity(capacity);
        let mut codec = DcpCodec::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                read = read_half.read_buf(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        loop {
                            match codec.decode(&mut buf) {
                                Ok(Some(frame)) => self.on_frame(frame),
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(address = %self.address, error = %e, "frame decode failed, dropping connection");
                                    token.cancel();
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(address = %self.address, error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
        self.on_socket_closed();
    }

    /// Socket gone: demote the channel and report the drop once
    fn on_socket_closed(&self) {
        {
            let mut inner = self.inner.lock().expect("channel inner");
            inner.writer = None;
            if let Some(token) = inner.lifecycle.take() {
                token.cancel();
            }
        }
        let was = self.state();
        self.state.send_replace(ChannelState::Disconnected);
        match was {
            ChannelState::Connected | ChannelState::Connecting => {
                if !self.dropped_reported.swap(true, Ordering::AcqRel) {
                    tracing::warn!(address = %self.address, "DCP channel dropped");
                    self.events.publish(SystemEvent::ChannelDropped {
                        address: self.address,
                    });
                }
            }
            _ => {
                tracing::info!(address = %self.address, "DCP channel disconnected");
            }
        }
    }

    /// Tear the connection down
    pub async fn disconnect(&self, wait: bool) {
        match self.state() {
            ChannelState::Connected | ChannelState::Connecting => {
                self.state.send_replace(ChannelState::Disconnecting);
                let token = {
                    let inner = self.inner.lock().expect("channel inner");
                    inner.lifecycle.clone()
                };
                match token {
                    Some(token) => token.cancel(),
                    // connect attempt still in flight; the loop observes
                    // the state change and aborts
                    None => {
                        self.state.send_replace(ChannelState::Disconnected);
                    }
                }
            }
            ChannelState::Disconnecting | ChannelState::Disconnected => {}
        }
        if wait {
            let mut rx = self.state.subscribe();
            let _ = rx
                .wait_for(|state| *state == ChannelState::Disconnected)
                .await;
        }
    }

    /// Probe for a producer that stopped talking
    ///
    /// Publishes a single `ChannelDropped` when no bytes arrived for
    /// longer than `interval` while connected.
    pub fn check_dead_connection(&self, interval: Duration) {
        if self.state() != ChannelState::Connected
            || self.dropped_reported.load(Ordering::Acquire)
        {
            return;
        }
        let idle = self.last_rx.lock().expect("last rx").elapsed();
        if idle > interval {
            tracing::info!(address = %self.address, idle = ?idle, "detected dead connection");
            self.dropped_reported.store(true, Ordering::Release);
            self.events.publish(SystemEvent::ChannelDropped {
                address: self.address,
            });
        }
    }

    // ------------------------------------------------------------------
    // Stream operations
    // ------------------------------------------------------------------

    /// Send a stream-open; on a dead channel a synthetic
    /// `StreamEnd(ChannelDropped)` is published instead
    pub fn open_stream(&self, request: &StreamRequest) {
        let partition = self.session.get(request.vbid);
        let writer = {
            let mut inner = self.inner.lock().expect("channel inner");
            if self.state() != ChannelState::Connected {
                None
            } else {
                inner.open_streams.set(usize::from(request.vbid), true);
                inner.writer.clone()
            }
        };
        let Some(writer) = writer else {
            tracing::warn!(vbid = request.vbid, address = %self.address, "stream open on disconnected channel");
            self.events.publish(SystemEvent::StreamEnd {
                vbid: request.vbid,
                reason: StreamEndReason::ChannelDropped,
                failover_logs_requested: false,
                seqnos_requested: false,
            });
            return;
        };
        tracing::debug!(
            vbid = request.vbid,
            start = request.start_seqno,
            end = request.end_seqno,
            vbuuid = format_args!("0x{:x}", request.vbuuid),
            snapshot_start = request.snapshot_start_seqno,
            snapshot_end = request.snapshot_end_seqno,
            "opening stream"
        );
        partition.set_phase(PartitionPhase::Connecting);
        let filter = request.filter_json();
        let _ = writer.send(request::stream_request(
            request.vbid,
            request.start_seqno,
            request.end_seqno,
            request.vbuuid,
            request.snapshot_start_seqno,
            request.snapshot_end_seqno,
            filter.as_deref(),
        ));
    }

    pub fn close_stream(&self, vbid: u16) -> Result<()> {
        let writer = {
            let mut inner = self.inner.lock().expect("channel inner");
            if self.state() != ChannelState::Connected {
                return Err(ClientError::NotConnected {
                    address: self.address,
                });
            }
            inner.open_streams.set(usize::from(vbid), false);
            inner.writer.clone()
        };
        self.session.get(vbid).set_phase(PartitionPhase::Disconnecting);
        if let Some(writer) = writer {
            let _ = writer.send(request::close_stream(vbid));
        }
        Ok(())
    }

    /// Ask for the failover log; failures resolve the partition's wait
    pub fn get_failover_log(&self, vbid: u16) {
        let partition = self.session.get(vbid);
        partition.failover_requested();
        let writer = {
            let mut inner = self.inner.lock().expect("channel inner");
            inner.failover_pending.set(usize::from(vbid), true);
            if self.state() != ChannelState::Connected {
                None
            } else {
                inner.writer.clone()
            }
        };
        match writer {
            Some(writer) => {
                tracing::debug!(vbid, address = %self.address, "requesting failover log");
                let _ = writer.send(request::get_failover_log(vbid));
            }
            None if !partition.is_client_disconnected() => {
                partition.failover_request_failed("channel not connected");
            }
            None => {}
        }
    }

    /// Sample remote high-watermarks for every active vbucket
    pub fn get_seqnos(&self) {
        self.state_fetched.send_replace(false);
        let writer = {
            let inner = self.inner.lock().expect("channel inner");
            if self.state() != ChannelState::Connected {
                None
            } else {
                inner.writer.clone()
            }
        };
        if let Some(writer) = writer {
            let _ = writer.send(request::get_seqnos(request::VBUCKET_STATE_ACTIVE));
        }
    }

    /// Fetch the collections manifest JSON
    pub async fn get_collections_manifest(&self, timeout: Duration) -> Result<Bytes> {
        self.manifest_signal.begin();
        let writer = {
            let inner = self.inner.lock().expect("channel inner");
            if self.state() != ChannelState::Connected {
                return Err(ClientError::NotConnected {
                    address: self.address,
                });
            }
            inner.writer.clone()
        };
        if let Some(writer) = writer {
            let _ = writer.send(request::get_collections_manifest());
        }
        self.manifest_signal.wait(timeout).await?;
        Ok(self
            .manifest
            .lock()
            .expect("manifest")
            .clone()
            .unwrap_or_default())
    }

    /// Credit consumed bytes; part of the public contract for embedders
    /// that ack outside the handle
    pub fn ack_bytes(&self, bytes: u64) {
        if let Some(flush) = self.flow.ack(bytes) {
            let writer = self.inner.lock().expect("channel inner").writer.clone();
            if let Some(writer) = writer {
                let _ = writer.send(request::buffer_ack(flush));
            }
        }
    }

    // ------------------------------------------------------------------
    // Demultiplexer
    // ------------------------------------------------------------------

    fn on_frame(&self, frame: Frame) {
        *self.last_rx.lock().expect("last rx") = Instant::now();
        let Some(opcode) = Opcode::from_u8(frame.opcode()) else {
            tracing::debug!(opcode = frame.opcode(), "unknown opcode, dropping frame");
            return;
        };
        let result = if frame.header.is_response() {
            self.on_response(opcode, &frame)
        } else {
            self.on_server_request(opcode, &frame)
        };
        if let Err(e) = result {
            tracing::warn!(address = %self.address, ?opcode, error = %e, "dropping malformed frame");
        }
    }

    fn on_response(&self, opcode: Opcode, frame: &Frame) -> std::result::Result<(), ProtocolError> {
        match opcode {
            Opcode::DcpStreamReq => self.on_open_stream_response(frame)?,
            Opcode::DcpGetFailoverLog => self.on_failover_log_response(frame)?,
            Opcode::DcpCloseStream => {
                let vbid = frame.header.opaque as u16;
                self.inner
                    .lock()
                    .expect("channel inner")
                    .open_streams
                    .set(usize::from(vbid), false);
                self.session.get(vbid).set_phase(PartitionPhase::Disconnected);
                tracing::debug!(vbid, "stream closed");
            }
            Opcode::GetAllVbSeqnos => {
                for (vbid, seqno) in view::parse_seqnos(&frame.value())? {
                    if usize::from(vbid) < self.session.partitions().len() {
                        self.session.get(vbid).observe_master_seqno(seqno);
                    }
                }
                self.state_fetched.send_replace(true);
            }
            Opcode::GetCollectionsManifest => {
                let status = Status::from_u16(frame.header.status());
                if status.is_success() {
                    *self.manifest.lock().expect("manifest") = Some(frame.value());
                    self.manifest_signal.complete();
                } else {
                    self.manifest_signal.fail(status.to_string());
                }
            }
            Opcode::DcpBufferAck => {
                tracing::trace!("buffer ack acknowledged");
            }
            other => {
                tracing::debug!(opcode = ?other, "unexpected response, dropping");
            }
        }
        Ok(())
    }

    fn on_server_request(
        &self,
        opcode: Opcode,
        frame: &Frame,
    ) -> std::result::Result<(), ProtocolError> {
        match opcode {
            Opcode::DcpSnapshotMarker => {
                let marker = view::parse_snapshot_marker(frame)?;
                let partition = self.session.get(marker.vbid);
                partition.set_snapshot(marker.start_seqno, marker.end_seqno);
                let ack = self.ack_handle(frame.wire_len() as u64);
                self.control_handler
                    .on_control_event(ack, ControlEvent::SnapshotMarker(marker));
            }
            Opcode::DcpMutation => self.on_data_frame(frame, DataKind::Mutation)?,
            Opcode::DcpDeletion => self.on_data_frame(frame, DataKind::Deletion)?,
            Opcode::DcpExpiration => self.on_data_frame(frame, DataKind::Expiration)?,
            Opcode::DcpOsoSnapshot => {
                let oso = view::parse_oso_snapshot(frame)?;
                let partition = self.session.get(oso.vbid);
                if oso.start {
                    tracing::debug!(vbid = oso.vbid, "out-of-order snapshot begins");
                    partition.begin_out_of_order();
                } else {
                    let promoted = partition.end_out_of_order();
                    tracing::debug!(vbid = oso.vbid, promoted, "out-of-order snapshot ends");
                }
            }
            Opcode::DcpStreamEnd => {
                let (vbid, reason) = view::parse_stream_end(frame)?;
                self.inner
                    .lock()
                    .expect("channel inner")
                    .open_streams
                    .set(usize::from(vbid), false);
                self.session.get(vbid).set_phase(PartitionPhase::Disconnected);
                tracing::debug!(vbid, %reason, "server closed stream");
                self.events.publish(SystemEvent::StreamEnd {
                    vbid,
                    reason,
                    failover_logs_requested: false,
                    seqnos_requested: false,
                });
            }
            Opcode::DcpSystemEvent => {
                let event = view::parse_system_event(frame)?;
                let partition = self.session.get(event.vbid);
                partition.on_system_event(event.seqno, event.manifest_uid);
                let ack = self.ack_handle(frame.wire_len() as u64);
                self.control_handler
                    .on_control_event(ack, ControlEvent::SystemEvent(event));
            }
            Opcode::DcpSeqnoAdvanced => {
                let (vbid, seqno) = view::parse_seqno_advanced(frame)?;
                self.session.get(vbid).advance_seqno(seqno);
            }
            Opcode::DcpNoop => {
                let writer = self.inner.lock().expect("channel inner").writer.clone();
                if let Some(writer) = writer {
                    let _ = writer.send(request::noop_reply(frame.header.opaque));
                }
            }
            other => {
                tracing::debug!(opcode = ?other, "unhandled server request, dropping");
            }
        }
        Ok(())
    }

    fn on_data_frame(
        &self,
        frame: &Frame,
        kind: DataKind,
    ) -> std::result::Result<(), ProtocolError> {
        let event = view::parse_data_event(frame, kind)?;
        self.session.get(event.vbid).set_seqno(event.by_seqno);
        let ack = self.ack_handle(frame.wire_len() as u64);
        self.data_handler.on_data_event(ack, event);
        Ok(())
    }

    fn on_open_stream_response(&self, frame: &Frame) -> std::result::Result<(), ProtocolError> {
        let vbid = frame.header.opaque as u16;
        let status = Status::from_u16(frame.header.status());
        let partition = self.session.get(vbid);
        tracing::debug!(vbid, %status, "open stream response");
        match status {
            Status::Success => {
                let entries = view::parse_failover_log(&frame.value())?;
                self.inner
                    .lock()
                    .expect("channel inner")
                    .open_streams
                    .set(usize::from(vbid), true);
                partition.failover_updated(entries);
                partition.record_open_success();
                partition.set_phase(PartitionPhase::Connected { node: self.address });
            }
            Status::Rollback => {
                let seqno = view::parse_rollback_seqno(frame)?;
                self.clear_stream_bit(vbid);
                partition.set_phase(PartitionPhase::Disconnected);
                tracing::warn!(vbid, seqno, "server demands rollback");
                let ack = AckHandle::new(Arc::clone(&self.flow), None, 0);
                self.control_handler
                    .on_control_event(ack, ControlEvent::Rollback { vbid, seqno });
                self.events.publish(SystemEvent::Rollback { vbid, seqno });
            }
            other => {
                self.clear_stream_bit(vbid);
                partition.set_phase(PartitionPhase::Disconnected);
                let delay = partition.record_open_failure();
                self.events.publish(SystemEvent::OpenStreamFailed {
                    vbid,
                    status: other,
                    delay,
                });
            }
        }
        Ok(())
    }

    fn on_failover_log_response(&self, frame: &Frame) -> std::result::Result<(), ProtocolError> {
        let vbid = frame.header.opaque as u16;
        let status = Status::from_u16(frame.header.status());
        let partition = self.session.get(vbid);
        match status {
            Status::Success => {
                let entries = view::parse_failover_log(&frame.value())?;
                self.inner
                    .lock()
                    .expect("channel inner")
                    .failover_pending
                    .set(usize::from(vbid), false);
                partition.failover_updated(entries);
            }
            Status::NotMyVbucket => {
                // the stream-side recovery path owns this case
            }
            other => {
                tracing::warn!(vbid, status = %other, "unexpected failover log response");
                partition.failover_request_failed(other.to_string());
            }
        }
        Ok(())
    }

    fn clear_stream_bit(&self, vbid: u16) {
        self.inner
            .lock()
            .expect("channel inner")
            .open_streams
            .set(usize::from(vbid), false);
    }

    fn ack_handle(&self, bytes: u64) -> AckHandle {
        let writer = self.inner.lock().expect("channel inner").writer.clone();
        self.flow.on_delivered(bytes);
        AckHandle::new(Arc::clone(&self.flow), writer, bytes)
    }
}

impl std::fmt::Debug for DcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpChannel")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

async fn writer_task(
    address: SocketAddr,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    token: CancellationToken,
) {
    let mut codec = DcpCodec::new();
    let mut out = BytesMut::with_capacity(4096);
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        out.clear();
        if codec.encode(frame, &mut out).is_err() {
            continue;
        }
        if let Err(e) = write_half.write_all(&out).await {
            tracing::debug!(address = %address, error = %e, "socket write failed");
            token.cancel();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Write one frame to a raw stream; used for the lockstep handshake
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: Frame) -> Result<()> {
    let mut out = BytesMut::with_capacity(frame.wire_len());
    DcpCodec::new()
        .encode(frame, &mut out)
        .map_err(ClientError::Protocol)?;
    writer.write_all(&out).await?;
    Ok(())
}

/// Read one complete frame from a raw stream
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    use riptide_protocol::{FrameHeader, HEADER_SIZE};
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(&header_bytes).map_err(ClientError::Protocol)?;
    let mut body = vec![0u8; header.total_body_length as usize];
    reader.read_exact(&mut body).await?;
    Ok(Frame {
        header,
        body: body.into(),
    })
}

/// Fixed-length bitset, private to the channel
#[derive(Debug)]
struct Bitset {
    words: Vec<u64>,
    len: usize,
}

impl Bitset {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, value: bool) {
        if index >= self.len {
            return;
        }
        let mask = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= mask;
        } else {
            self.words[index / 64] &= !mask;
        }
    }

    fn any(&self) -> bool {
        self.words.iter().any(|word| *word != 0)
    }

    fn ones(&self) -> Vec<u16> {
        let mut ones = Vec::new();
        for index in 0..self.len {
            if self.get(index) {
                ones.push(index as u16);
            }
        }
        ones
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
